//! Proxied maintenance strategy: health probes over the bus, with peer
//! liveness events driving the reconnected signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metastore_core::proto::{peer, rpc};
use metastore_core::StatusResponse;
use parking_lot::{Mutex, RwLock};
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{MaintenanceStrategy, ReconnectedCallback};
use crate::bus::{BusAddress, BusMessage, MessageBus, PeerEvent};
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::retry::RequestTracker;

/// Actor name of the peer's maintenance accessor.
pub const MAINTENANCE_SERVICE_ACTOR: &str = "MaintenanceServiceAccessorActor";

/// How long a peer must stay back before its return is believed.
const RECONNECT_CONFIRM_INTERVAL: Duration = Duration::from_secs(10);

struct Shared {
    bus: Arc<dyn MessageBus>,
    self_address: BusAddress,
    target: RwLock<BusAddress>,
    tracker: RequestTracker<StatusResponse>,
    callback: RwLock<Option<ReconnectedCallback>>,
    connected: AtomicBool,
}

impl Shared {
    fn reconnected(&self, address: String) {
        self.connected.store(true, Ordering::Release);
        info!(%address, "peer reachable again");
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(address);
        }
    }
}

pub struct ProxyMaintenanceStrategy {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyMaintenanceStrategy {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        local_node: &str,
        peer_node: &str,
        options: TimeoutOptions,
    ) -> Self {
        let name = format!("MetaStoreMaintenanceClient-{}", Uuid::new_v4());
        let self_address = BusAddress::new(name.clone(), local_node);
        let shared = Arc::new(Shared {
            target: RwLock::new(BusAddress::new(MAINTENANCE_SERVICE_ACTOR, peer_node)),
            tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            callback: RwLock::new(None),
            connected: AtomicBool::new(true),
            self_address,
            bus,
        });

        let running = Arc::new(AtomicBool::new(true));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        shared.bus.register(&name, inbox_tx);
        let dispatcher = tokio::spawn(dispatch(inbox_rx, shared.clone()));

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        shared.bus.subscribe_peer_events(peer_tx);
        let peer_watch = tokio::spawn(watch_peer_events(peer_rx, shared.clone(), running.clone()));

        Self {
            shared,
            running,
            tasks: Mutex::new(vec![dispatcher, peer_watch]),
        }
    }
}

#[async_trait]
impl MaintenanceStrategy for ProxyMaintenanceStrategy {
    async fn health_check(&self) -> Result<StatusResponse> {
        let request_id = Uuid::new_v4().to_string();
        let payload: Bytes = peer::MetaStoreRequest {
            request_id: request_id.clone(),
            request_msg: rpc::StatusRequest {}.encode_to_vec(),
            async_backup: true,
        }
        .encode_to_vec()
        .into();
        let target = self.shared.target.read().clone();
        let result = self
            .shared
            .tracker
            .begin(request_id, target, "HealthCheck", payload)
            .await;
        match &result {
            Ok(_) => self.shared.connected.store(true, Ordering::Release),
            Err(_) => self.shared.connected.store(false, Ordering::Release),
        }
        result
    }

    async fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn bind_reconnected_callback(&self, callback: ReconnectedCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shared.bus.unregister(&self.shared.self_address.name);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn watch_peer_events(
    mut inbox: mpsc::UnboundedReceiver<PeerEvent>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
) {
    while let Some(event) = inbox.recv().await {
        if !running.load(Ordering::Acquire) {
            return;
        }
        match event {
            PeerEvent::Connected { node } => {
                let moved = shared.target.read().node != node;
                if moved {
                    // the peer came back somewhere else; no point confirming
                    shared.target.write().node = node.clone();
                    shared.reconnected(node);
                } else {
                    // same address: wait out flapping before believing it
                    let shared = shared.clone();
                    let running = running.clone();
                    tokio::spawn(async move {
                        sleep(RECONNECT_CONFIRM_INTERVAL).await;
                        if running.load(Ordering::Acquire) {
                            shared.reconnected(node);
                        }
                    });
                }
            }
            PeerEvent::Disconnected { node } => {
                warn!(%node, "peer disconnected");
                shared.connected.store(false, Ordering::Release);
            }
        }
    }
}

async fn dispatch(mut inbox: mpsc::UnboundedReceiver<BusMessage>, shared: Arc<Shared>) {
    while let Some(message) = inbox.recv().await {
        match message.method.as_str() {
            "OnHealthCheck" => {
                let Ok(envelope) = peer::MetaStoreResponse::decode(message.payload.as_ref())
                else {
                    error!("failed to parse health check reply envelope");
                    continue;
                };
                let value = if envelope.status != 0 {
                    Err(Error::Unknown(format!(
                        "peer status {}: {}",
                        envelope.status, envelope.error_msg
                    )))
                } else {
                    rpc::StatusResponse::decode(envelope.response_msg.as_slice())
                        .map(StatusResponse::from)
                        .map_err(Error::from)
                };
                shared.tracker.end(&envelope.response_id, value);
            }
            other => debug!(method = other, "ignoring unexpected bus message"),
        }
    }
}
