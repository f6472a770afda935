//! The key-value surface: put/get/delete/txn plus the watch engine.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use metastore_core::proto::rpc;
use metastore_core::{
    DeleteOptions, DeleteResponse, GetOptions, GetResponse, PutOptions, PutResponse, SyncResult,
    TxnResponse, WatchEvent, WatchOptions,
};

use crate::error::Result;
use crate::health::HealthObserver;

mod etcd;
mod proxy;
mod records;

pub use etcd::EtcdKvStrategy;
pub use proxy::ProxyKvStrategy;

/// Invoked with each translated event batch. The `synced` flag marks batches
/// delivered as part of a resync rather than live watch traffic.
pub type WatchObserver = Box<dyn FnMut(Vec<WatchEvent>, bool) -> bool + Send>;

/// Re-reads the watched data after a compaction cancelled the watch; returns
/// the revision to resume from, or `None` when the sync itself failed (the
/// watch then resumes from its previous revision).
pub type Syncer = Box<dyn Fn() -> BoxFuture<'static, Option<SyncResult>> + Send + Sync>;

/// The id a watcher carries before the server acknowledges it.
pub const UNASSIGNED_WATCH_ID: i64 = -1;

struct WatcherInner {
    watch_id: AtomicI64,
    cancelled: AtomicBool,
    on_cancel: Box<dyn Fn(i64) + Send + Sync>,
}

/// Cancelable handle to a single watch.
///
/// Cancellation is idempotent and asynchronous: the server's cancel
/// acknowledgement is processed by the strategy's reader loop. A watcher
/// cancelled while still pending is dropped when its created-ack arrives.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    pub(crate) fn new(on_cancel: impl Fn(i64) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                watch_id: AtomicI64::new(UNASSIGNED_WATCH_ID),
                cancelled: AtomicBool::new(false),
                on_cancel: Box::new(on_cancel),
            }),
        }
    }

    /// A stub handle not tied to any record; used when a non-retrying watch
    /// could not be established.
    pub(crate) fn detached() -> Self {
        Self::new(|_| {})
    }

    /// The server-assigned id, or [`UNASSIGNED_WATCH_ID`] while pending.
    pub fn watch_id(&self) -> i64 {
        self.inner.watch_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_watch_id(&self, watch_id: i64) {
        self.inner.watch_id.store(watch_id, Ordering::Release);
    }

    /// Back to pending, keeping the cancelled flag; used when re-watching.
    pub(crate) fn reset(&self) {
        self.inner
            .watch_id
            .store(UNASSIGNED_WATCH_ID, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Stop the watch. The first call notifies the owning strategy; further
    /// calls are no-ops.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            (self.inner.on_cancel)(self.watch_id());
        }
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("watch_id", &self.watch_id())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One registered watch: its key, advancing start revision, observer and
/// optional syncer. Owned exclusively by the strategy's engine task.
pub(crate) struct WatchRecord {
    pub key: String,
    pub options: WatchOptions,
    pub observer: WatchObserver,
    pub syncer: Option<Syncer>,
    pub watcher: Watcher,
    /// Correlation id while awaiting the peer's created reply (proxy only).
    pub uuid: String,
}

impl WatchRecord {
    /// Deliver a batch, shielding the engine from observer panics.
    pub fn notify(&mut self, events: Vec<WatchEvent>, synced: bool) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (self.observer)(events, synced)
        }));
        if result.is_err() {
            tracing::error!(key = %self.key, "watch observer panicked; event batch dropped");
        }
    }
}

/// Uniform strategy surface for the key-value service, implemented directly
/// against the backend and via the peer proxy.
#[async_trait]
pub trait KvStrategy: HealthObserver {
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<PutResponse>;

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse>;

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResponse>;

    /// Commit a prepared transaction, decoding the per-op responses.
    async fn commit_txn(&self, request: rpc::TxnRequest, async_backup: bool) -> Result<TxnResponse>;

    /// Commit and hand back the raw wire response.
    async fn commit_raw(
        &self,
        request: rpc::TxnRequest,
        async_backup: bool,
    ) -> Result<rpc::TxnResponse>;

    /// Subscribe to changes of `key` starting at `options.revision`.
    async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher>;

    /// Read the current state, deliver it as one `synced` batch, then watch
    /// from the revision after the read.
    async fn get_and_watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher>;

    async fn is_connected(&self) -> bool;

    /// The proxy peer address changed; re-target and resynchronize.
    fn on_address_updated(&self, _address: &str) {}

    /// Stop streams, cancel watches and join the reader tasks.
    async fn shutdown(&self);
}
