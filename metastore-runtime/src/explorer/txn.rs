//! Raw-key explorer: discovers the leader by watching the election key
//! itself. Only PUT events matter here; a DELETE triggers re-election on
//! the leader side and is ignored by discovery.

use std::sync::Arc;

use futures::FutureExt;
use metastore_client::MetastoreClient;
use metastore_core::{EventType, GetOptions, SyncResult, WatchOptions};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{ExplorerHandle, ExplorerMsg, ExplorerState, LeaderInfo};

pub struct TxnExplorer;

impl TxnExplorer {
    /// Spawn the explorer actor and start watching `election_key`.
    pub fn start(election_key: &str, client: Arc<MetastoreClient>) -> ExplorerHandle {
        let cached = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ExplorerHandle::new(tx.clone(), cached.clone());
        let state = ExplorerState::new(election_key, cached, false);
        tokio::spawn(run(state, rx, tx, client));
        handle
    }
}

fn leader_from_kv(kv: &metastore_core::proto::mvcc::KeyValue) -> LeaderInfo {
    LeaderInfo {
        name: String::from_utf8_lossy(&kv.key).into_owned(),
        address: String::from_utf8_lossy(&kv.value).into_owned(),
        revision: kv.mod_revision,
    }
}

async fn run(
    mut state: ExplorerState,
    mut rx: mpsc::UnboundedReceiver<ExplorerMsg>,
    tx: mpsc::UnboundedSender<ExplorerMsg>,
    client: Arc<MetastoreClient>,
) {
    info!(key = %state.election_key, "starting leader key watch");
    let event_tx = tx.clone();
    let observer = Box::new(move |events: Vec<metastore_core::WatchEvent>, _synced: bool| {
        for event in &events {
            if event.event_type != EventType::Put {
                continue;
            }
            let _ = event_tx.send(ExplorerMsg::Leader(leader_from_kv(&event.kv)));
        }
        true
    });

    let sync_client = client.clone();
    let sync_key = state.election_key.clone();
    let sync_tx = tx.clone();
    let syncer = Box::new(move || {
        let client = sync_client.clone();
        let key = sync_key.clone();
        let tx = sync_tx.clone();
        async move {
            info!(key = %key, "resyncing leader key");
            match client.get(&key, GetOptions::default().with_prefix()).await {
                Ok(response) => {
                    if let Some(kv) = response.kvs.first() {
                        let _ = tx.send(ExplorerMsg::Leader(leader_from_kv(kv)));
                    } else {
                        warn!(key = %key, "no leader recorded during resync");
                    }
                    Some(SyncResult {
                        revision: response.header.revision,
                    })
                }
                Err(err) => {
                    error!(key = %key, "leader resync failed: {err}");
                    None
                }
            }
        }
        .boxed()
    });

    let watcher = client
        .get_and_watch(
            &state.election_key,
            WatchOptions::default(),
            observer,
            Some(syncer),
        )
        .await;
    let watcher = match watcher {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            error!(key = %state.election_key, "failed to watch leader key: {err}");
            None
        }
    };

    while let Some(msg) = rx.recv().await {
        if let Some(reply) = state.handle(msg) {
            if let Some(watcher) = &watcher {
                watcher.cancel();
            }
            let _ = reply.send(());
            return;
        }
    }
}
