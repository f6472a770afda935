//! The election surface: campaign/leader/resign/observe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metastore_core::{CampaignResponse, LeaderKey, LeaderResponse, ResignResponse};

use crate::error::Result;
use crate::health::HealthObserver;

mod etcd;
mod proxy;

pub use etcd::EtcdElectionStrategy;
pub use proxy::ProxyElectionStrategy;

/// Invoked with every observed leader update.
pub type ObserveCallback = Arc<dyn Fn(LeaderResponse) + Send + Sync>;

struct ObserverInner {
    cancelled: AtomicBool,
    on_shutdown: Box<dyn Fn() + Send + Sync>,
}

/// Handle to a leader observation. Shutdown is idempotent; once shut down
/// the callback is never invoked again for this observation.
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    pub(crate) fn new(on_shutdown: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                cancelled: AtomicBool::new(false),
                on_shutdown: Box::new(on_shutdown),
            }),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            (self.inner.on_shutdown)();
        }
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("cancelled", &self.is_shut_down())
            .finish()
    }
}

/// Uniform strategy surface for the election service. Election keys are
/// transparently namespaced with the table prefix on the wire.
#[async_trait]
pub trait ElectionStrategy: HealthObserver {
    /// Block until leadership of `name` is acquired under `lease_id`.
    async fn campaign(
        &self,
        name: &str,
        lease_id: i64,
        proposal: Vec<u8>,
    ) -> Result<CampaignResponse>;

    /// The current leader of `name`.
    async fn leader(&self, name: &str) -> Result<LeaderResponse>;

    /// Give up leadership held under `leader`.
    async fn resign(&self, leader: LeaderKey) -> Result<ResignResponse>;

    /// Stream leader updates for `name` into `callback` until the returned
    /// observer is shut down.
    async fn observe(&self, name: &str, callback: ObserveCallback) -> Result<Observer>;

    async fn is_connected(&self) -> bool;

    fn on_address_updated(&self, _address: &str) {}

    async fn shutdown(&self);
}
