//! Election-API explorer: discovers the leader through an Observe stream.

use std::sync::Arc;

use metastore_client::MetastoreClient;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{ExplorerHandle, ExplorerMsg, ExplorerState, LeaderInfo};

pub struct EtcdExplorer;

impl EtcdExplorer {
    /// Spawn the explorer actor and start observing `election_key`.
    pub fn start(election_key: &str, client: Arc<MetastoreClient>) -> ExplorerHandle {
        let cached = Arc::new(RwLock::new(None));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ExplorerHandle::new(tx.clone(), cached.clone());
        let state = ExplorerState::new(election_key, cached, true);
        tokio::spawn(run(state, rx, tx, client));
        handle
    }
}

async fn run(
    mut state: ExplorerState,
    mut rx: mpsc::UnboundedReceiver<ExplorerMsg>,
    tx: mpsc::UnboundedSender<ExplorerMsg>,
    client: Arc<MetastoreClient>,
) {
    info!(key = %state.election_key, "starting election observation");
    let callback_tx = tx.clone();
    let observer = client
        .observe(
            &state.election_key,
            Arc::new(move |response| {
                let info = LeaderInfo {
                    name: response.key.clone(),
                    address: String::from_utf8_lossy(&response.value).into_owned(),
                    revision: response.header.revision,
                };
                let _ = callback_tx.send(ExplorerMsg::Leader(info));
            }),
        )
        .await;
    let observer = match observer {
        Ok(observer) => Some(observer),
        Err(err) => {
            error!(key = %state.election_key, "failed to observe election: {err}");
            None
        }
    };

    while let Some(msg) = rx.recv().await {
        if let Some(reply) = state.handle(msg) {
            if let Some(observer) = &observer {
                observer.shutdown();
            }
            let _ = reply.send(());
            return;
        }
    }
}
