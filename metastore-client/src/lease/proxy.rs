//! Proxied lease strategy: grant/revoke/keep-alive as UUID-keyed envelopes
//! through the peer service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metastore_core::proto::{peer, rpc};
use metastore_core::{LeaseGrantResponse, LeaseKeepAliveResponse, LeaseRevokeResponse};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::LeaseStrategy;
use crate::bus::{BusAddress, BusMessage, MessageBus};
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::health::{HealthGate, HealthObserver, HealthStatus};
use crate::retry::RequestTracker;

/// Actor name of the peer's lease accessor.
pub const LEASE_SERVICE_ACTOR: &str = "LeaseServiceAccessorActor";

struct Shared {
    bus: Arc<dyn MessageBus>,
    self_address: BusAddress,
    target: RwLock<BusAddress>,
    gate: HealthGate,
    grant_tracker: RequestTracker<LeaseGrantResponse>,
    revoke_tracker: RequestTracker<LeaseRevokeResponse>,
    keep_alive_tracker: RequestTracker<LeaseKeepAliveResponse>,
}

pub struct ProxyLeaseStrategy {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyLeaseStrategy {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        local_node: &str,
        peer_node: &str,
        options: TimeoutOptions,
    ) -> Self {
        let name = format!("MetaStoreLeaseClient-{}", Uuid::new_v4());
        let self_address = BusAddress::new(name.clone(), local_node);
        let shared = Arc::new(Shared {
            target: RwLock::new(BusAddress::new(LEASE_SERVICE_ACTOR, peer_node)),
            gate: HealthGate::new(),
            grant_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            revoke_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            keep_alive_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            self_address,
            bus,
        });

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        shared.bus.register(&name, inbox_tx);
        let dispatcher = tokio::spawn(dispatch(inbox_rx, shared.clone()));

        Self {
            shared,
            running: Arc::new(AtomicBool::new(true)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    fn check_gate(&self, op: &str) -> Result<()> {
        match self.shared.gate.tripped() {
            Some(detail) => Err(Error::FallBreak(format!("failed to call {op}: {detail}"))),
            None => Ok(()),
        }
    }

    fn envelope(&self, request_id: &str, inner: impl Message) -> Bytes {
        peer::MetaStoreRequest {
            request_id: request_id.to_string(),
            request_msg: inner.encode_to_vec(),
            async_backup: true,
        }
        .encode_to_vec()
        .into()
    }
}

impl HealthObserver for ProxyLeaseStrategy {
    fn on_healthy_status(&self, status: HealthStatus) {
        warn!(?status, "updating proxied lease client health status");
        self.shared.gate.on_healthy_status(status);
    }
}

#[async_trait]
impl LeaseStrategy for ProxyLeaseStrategy {
    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        self.check_gate("Grant")?;
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, ttl, "sending lease grant to peer");
        let payload = self.envelope(&request_id, rpc::LeaseGrantRequest { ttl, id: 0 });
        let target = self.shared.target.read().clone();
        self.shared
            .grant_tracker
            .begin(request_id, target, "Grant", payload)
            .await
    }

    async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse> {
        self.check_gate("Revoke")?;
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, lease_id, "sending lease revoke to peer");
        let payload = self.envelope(&request_id, rpc::LeaseRevokeRequest { id: lease_id });
        let target = self.shared.target.read().clone();
        self.shared
            .revoke_tracker
            .begin(request_id, target, "Revoke", payload)
            .await
    }

    async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
        self.check_gate("KeepAliveOnce")?;
        let request_id = Uuid::new_v4().to_string();
        let payload = self.envelope(&request_id, rpc::LeaseKeepAliveRequest { id: lease_id });
        let target = self.shared.target.read().clone();
        let response = self
            .shared
            .keep_alive_tracker
            .begin(request_id, target, "KeepAliveOnce", payload)
            .await?;
        if response.ttl == 0 {
            return Err(Error::LeaseExpired(lease_id));
        }
        Ok(response)
    }

    async fn is_connected(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn on_address_updated(&self, address: &str) {
        info!(address, "peer address updated, re-targeting lease strategy");
        self.shared.target.write().node = address.to_string();
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.shared.bus.unregister(&self.shared.self_address.name);
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
    }
}

async fn dispatch(mut inbox: mpsc::UnboundedReceiver<BusMessage>, shared: Arc<Shared>) {
    while let Some(message) = inbox.recv().await {
        match message.method.as_str() {
            "OnGrant" => complete(&shared.grant_tracker, &message.payload, |raw: rpc::LeaseGrantResponse| {
                LeaseGrantResponse::from(raw)
            }),
            "OnRevoke" => complete(&shared.revoke_tracker, &message.payload, |raw: rpc::LeaseRevokeResponse| {
                LeaseRevokeResponse::from(raw)
            }),
            "OnKeepAliveOnce" => complete(&shared.keep_alive_tracker, &message.payload, |raw: rpc::LeaseKeepAliveResponse| {
                LeaseKeepAliveResponse::from(raw)
            }),
            other => debug!(method = other, "ignoring unexpected bus message"),
        }
    }
}

fn complete<T, R>(tracker: &RequestTracker<R>, payload: &[u8], decode: impl FnOnce(T) -> R)
where
    T: Message + Default,
    R: Send + 'static,
{
    let Ok(envelope) = peer::MetaStoreResponse::decode(payload) else {
        error!("failed to parse lease reply envelope");
        return;
    };
    let value = if envelope.status != 0 {
        Err(Error::Unknown(format!(
            "peer status {}: {}",
            envelope.status, envelope.error_msg
        )))
    } else {
        T::decode(envelope.response_msg.as_slice())
            .map(decode)
            .map_err(Error::from)
    };
    tracker.end(&envelope.response_id, value);
}
