//! Leader discovery.
//!
//! An explorer keeps a cached view of the current leader for one election
//! key, re-subscribes when its source reconnects, and invokes registered
//! callbacks on every accepted change. Updates carrying a revision at or
//! below the cached one are ignored, so replayed history and the fast-path
//! publication cannot move the view backwards.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

mod etcd;
mod txn;

pub use etcd::EtcdExplorer;
pub use txn::TxnExplorer;

/// The discovered leader of one election key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaderInfo {
    /// The leadership key as observed.
    pub name: String,
    /// The winning proposal, conventionally the leader's address.
    pub address: String,
    /// Revision of the election event; gates stale updates.
    pub revision: i64,
}

/// Invoked on the explorer actor with every accepted leader change.
pub type LeaderCallback = Arc<dyn Fn(&LeaderInfo) + Send + Sync>;

pub(crate) enum ExplorerMsg {
    Leader(LeaderInfo),
    FastPublish(LeaderInfo),
    AddCallback(String, LeaderCallback),
    RemoveCallback(String),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running explorer actor.
#[derive(Clone)]
pub struct ExplorerHandle {
    pub(crate) tx: mpsc::UnboundedSender<ExplorerMsg>,
    cached: Arc<RwLock<Option<LeaderInfo>>>,
}

impl ExplorerHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<ExplorerMsg>,
        cached: Arc<RwLock<Option<LeaderInfo>>>,
    ) -> Self {
        Self { tx, cached }
    }

    /// The latest accepted leader, if any has been observed yet.
    pub fn cached_leader(&self) -> Option<LeaderInfo> {
        self.cached.read().clone()
    }

    pub fn add_callback(&self, id: impl Into<String>, callback: LeaderCallback) {
        let _ = self.tx.send(ExplorerMsg::AddCallback(id.into(), callback));
    }

    pub fn remove_callback(&self, id: &str) {
        let _ = self.tx.send(ExplorerMsg::RemoveCallback(id.to_string()));
    }

    /// Publish leadership without waiting for the observation round-trip.
    /// Still gated on revision monotonicity.
    pub fn fast_publish(&self, info: LeaderInfo) {
        let _ = self.tx.send(ExplorerMsg::FastPublish(info));
    }

    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(ExplorerMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// The revision-gated cache and callback fan-out shared by every flavor.
pub(crate) struct ExplorerState {
    pub election_key: String,
    pub cached: Arc<RwLock<Option<LeaderInfo>>>,
    pub revision: i64,
    pub callbacks: HashMap<String, LeaderCallback>,
    /// The raw-key flavor ignores fast publication; observation is its only
    /// source of truth.
    pub accept_fast_publish: bool,
}

impl ExplorerState {
    pub fn new(
        election_key: &str,
        cached: Arc<RwLock<Option<LeaderInfo>>>,
        accept_fast_publish: bool,
    ) -> Self {
        Self {
            election_key: election_key.to_string(),
            cached,
            revision: 0,
            callbacks: HashMap::new(),
            accept_fast_publish,
        }
    }

    pub fn handle(&mut self, msg: ExplorerMsg) -> Option<oneshot::Sender<()>> {
        match msg {
            ExplorerMsg::Leader(info) => self.update(info),
            ExplorerMsg::FastPublish(info) => {
                if self.accept_fast_publish {
                    info!(
                        key = %self.election_key,
                        address = %info.address,
                        revision = info.revision,
                        "fast publishing leader"
                    );
                    self.update(info);
                }
            }
            ExplorerMsg::AddCallback(id, callback) => {
                info!(key = %self.election_key, %id, "registering leader change callback");
                if let Some(info) = self.cached.read().clone() {
                    callback(&info);
                }
                self.callbacks.insert(id, callback);
            }
            ExplorerMsg::RemoveCallback(id) => {
                info!(key = %self.election_key, %id, "removing leader change callback");
                self.callbacks.remove(&id);
            }
            ExplorerMsg::Shutdown(reply) => return Some(reply),
        }
        None
    }

    fn update(&mut self, info: LeaderInfo) {
        if info.revision != 0 && info.revision <= self.revision {
            warn!(
                key = %self.election_key,
                revision = info.revision,
                current = self.revision,
                "ignoring stale leader update"
            );
            return;
        }
        if info.revision != 0 {
            self.revision = info.revision;
        }
        *self.cached.write() = Some(info.clone());
        for (id, callback) in &self.callbacks {
            debug!(key = %self.election_key, %id, address = %info.address, "leader change callback");
            callback(&info);
        }
    }
}

/// Explorers bound per election key; the explicit replacement for a global
/// registry, injected where discovery is needed.
#[derive(Default)]
pub struct ExplorerRegistry {
    explorers: Mutex<HashMap<String, ExplorerHandle>>,
}

impl ExplorerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, election_key: &str, handle: ExplorerHandle) {
        info!(key = election_key, "binding explorer");
        self.explorers
            .lock()
            .insert(election_key.to_string(), handle);
    }

    pub fn unbind(&self, election_key: &str) {
        self.explorers.lock().remove(election_key);
    }

    pub fn get(&self, election_key: &str) -> Option<ExplorerHandle> {
        self.explorers.lock().get(election_key).cloned()
    }

    /// Register a callback on every bound explorer.
    pub fn add_leader_changed_callback(&self, id: &str, callback: LeaderCallback) {
        for handle in self.explorers.lock().values() {
            handle.add_callback(id, callback.clone());
        }
    }

    pub fn remove_leader_changed_callback(&self, id: &str) {
        for handle in self.explorers.lock().values() {
            handle.remove_callback(id);
        }
    }

    pub async fn clear(&self) {
        let drained = {
            let mut explorers = self.explorers.lock();
            explorers.drain().collect::<Vec<_>>()
        };
        for (_, handle) in drained {
            handle.shutdown().await;
        }
    }
}

/// A fixed-leader explorer for standalone deployments: no backend
/// observation, just the cache and callbacks.
pub struct StandaloneExplorer;

impl StandaloneExplorer {
    pub fn start(election_key: &str, leader: LeaderInfo) -> ExplorerHandle {
        let cached = Arc::new(RwLock::new(None));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut state = ExplorerState::new(election_key, cached.clone(), true);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Some(reply) = state.handle(msg) {
                    let _ = reply.send(());
                    return;
                }
            }
        });
        let handle = ExplorerHandle::new(tx, cached);
        handle.fast_publish(leader);
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn leader(address: &str, revision: i64) -> LeaderInfo {
        LeaderInfo {
            name: "/master".into(),
            address: address.into(),
            revision,
        }
    }

    async fn drain() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn stale_revisions_are_ignored() {
        let handle = StandaloneExplorer::start("/master", leader("a:1", 5));
        drain().await;
        assert_eq!(handle.cached_leader(), Some(leader("a:1", 5)));

        handle.fast_publish(leader("b:1", 5));
        drain().await;
        assert_eq!(handle.cached_leader(), Some(leader("a:1", 5)));

        handle.fast_publish(leader("b:1", 4));
        drain().await;
        assert_eq!(handle.cached_leader(), Some(leader("a:1", 5)));

        handle.fast_publish(leader("b:1", 6));
        drain().await;
        assert_eq!(handle.cached_leader(), Some(leader("b:1", 6)));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn callbacks_fire_on_accepted_updates_only() {
        let handle = StandaloneExplorer::start("/master", leader("a:1", 1));
        drain().await;

        let seen: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let seen_cb = seen.clone();
        handle.add_callback(
            "test",
            Arc::new(move |info| seen_cb.lock().push(info.address.clone())),
        );
        drain().await;
        // registration replays the cached leader
        assert_eq!(seen.lock().clone(), vec!["a:1".to_string()]);

        handle.fast_publish(leader("b:1", 2));
        handle.fast_publish(leader("c:1", 2));
        drain().await;
        assert_eq!(seen.lock().clone(), vec!["a:1".to_string(), "b:1".to_string()]);

        handle.remove_callback("test");
        handle.fast_publish(leader("d:1", 9));
        drain().await;
        assert_eq!(seen.lock().len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn registry_fans_out_callbacks() {
        let registry = ExplorerRegistry::new();
        let first = StandaloneExplorer::start("/a", leader("a:1", 1));
        let second = StandaloneExplorer::start("/b", leader("b:1", 1));
        drain().await;
        registry.bind("/a", first.clone());
        registry.bind("/b", second.clone());

        let count = Arc::new(PlMutex::new(0usize));
        let count_cb = count.clone();
        registry.add_leader_changed_callback(
            "observer",
            Arc::new(move |_| *count_cb.lock() += 1),
        );
        drain().await;
        // replay of both cached leaders
        assert_eq!(*count.lock(), 2);

        registry.clear().await;
        assert!(registry.get("/a").is_none());
    }
}
