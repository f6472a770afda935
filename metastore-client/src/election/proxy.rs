//! Proxied election strategy.
//!
//! Observers are correlated by uuid until the peer's `isCreate` reply binds
//! an observe id. A server-initiated cancel that the client did not request
//! re-creates the observation automatically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metastore_core::proto::{election, peer};
use metastore_core::{prefix, CampaignResponse, LeaderKey, LeaderResponse, ResignResponse};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ElectionStrategy, ObserveCallback, Observer};
use crate::bus::{BusAddress, BusMessage, MessageBus};
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::health::{HealthGate, HealthObserver, HealthStatus};
use crate::retry::RequestTracker;

/// Actor name of the peer's election accessor.
pub const ELECTION_SERVICE_ACTOR: &str = "ElectionServiceAccessorActor";

struct Shared {
    bus: Arc<dyn MessageBus>,
    self_address: BusAddress,
    target: RwLock<BusAddress>,
    table_prefix: String,
    gate: HealthGate,
    campaign_tracker: RequestTracker<CampaignResponse>,
    leader_tracker: RequestTracker<LeaderResponse>,
    resign_tracker: RequestTracker<ResignResponse>,
    observe_tracker: RequestTracker<()>,
}

impl Shared {
    fn target(&self) -> BusAddress {
        self.target.read().clone()
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

pub struct ProxyElectionStrategy {
    shared: Arc<Shared>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyElectionStrategy {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        local_node: &str,
        peer_node: &str,
        table_prefix: &str,
        options: TimeoutOptions,
    ) -> Self {
        let name = format!("MetaStoreElectionClient-{}", Uuid::new_v4());
        let self_address = BusAddress::new(name.clone(), local_node);
        let shared = Arc::new(Shared {
            target: RwLock::new(BusAddress::new(ELECTION_SERVICE_ACTOR, peer_node)),
            table_prefix: table_prefix.to_string(),
            gate: HealthGate::new(),
            campaign_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            leader_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            resign_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            observe_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            self_address,
            bus,
        });

        let running = Arc::new(AtomicBool::new(true));
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = ObserveEngine {
            shared: shared.clone(),
            tx: engine_tx.clone(),
            records: HashMap::new(),
            pending_by_uuid: HashMap::new(),
            ready: HashMap::new(),
            next_id: 0,
        };
        let engine_task = tokio::spawn(engine.run(engine_rx));

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        shared.bus.register(&name, inbox_tx);
        let dispatcher_task = tokio::spawn(dispatch(inbox_rx, shared.clone(), engine_tx.clone()));

        Self {
            shared,
            engine_tx,
            running,
            tasks: Mutex::new(vec![engine_task, dispatcher_task]),
        }
    }

    fn check_gate(&self, op: &str) -> Result<()> {
        match self.shared.gate.tripped() {
            Some(detail) => Err(Error::FallBreak(format!("failed to call {op}: {detail}"))),
            None => Ok(()),
        }
    }
}

impl HealthObserver for ProxyElectionStrategy {
    fn on_healthy_status(&self, status: HealthStatus) {
        warn!(?status, "updating proxied election client health status");
        self.shared.gate.on_healthy_status(status);
    }
}

#[async_trait]
impl ElectionStrategy for ProxyElectionStrategy {
    async fn campaign(
        &self,
        name: &str,
        lease_id: i64,
        proposal: Vec<u8>,
    ) -> Result<CampaignResponse> {
        self.check_gate("Campaign")?;
        let inner = election::CampaignRequest {
            name: prefix::prefix_key(&self.shared.table_prefix, name),
            lease: lease_id,
            value: proposal,
        };
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, name, "sending campaign to peer");
        let payload = self.shared.envelope(&request_id, inner);
        self.shared
            .campaign_tracker
            .begin(request_id, self.shared.target(), "Campaign", payload)
            .await
    }

    async fn leader(&self, name: &str) -> Result<LeaderResponse> {
        self.check_gate("Leader")?;
        let inner = election::LeaderRequest {
            name: prefix::prefix_key(&self.shared.table_prefix, name),
        };
        let request_id = Uuid::new_v4().to_string();
        let payload = self.shared.envelope(&request_id, inner);
        self.shared
            .leader_tracker
            .begin(request_id, self.shared.target(), "Leader", payload)
            .await
    }

    async fn resign(&self, leader: LeaderKey) -> Result<ResignResponse> {
        self.check_gate("Resign")?;
        let inner = election::ResignRequest {
            leader: Some(leader.to_proto(&self.shared.table_prefix)),
        };
        let request_id = Uuid::new_v4().to_string();
        let payload = self.shared.envelope(&request_id, inner);
        self.shared
            .resign_tracker
            .begin(request_id, self.shared.target(), "Resign", payload)
            .await
    }

    async fn observe(&self, name: &str, callback: ObserveCallback) -> Result<Observer> {
        self.check_gate("Observe")?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.engine_tx
            .send(EngineMsg::Observe {
                name: name.to_string(),
                callback,
                reply: reply_tx,
            })
            .map_err(|_| Error::Shutdown("observe engine stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Shutdown("observe engine stopped".into()))
    }

    async fn is_connected(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn on_address_updated(&self, address: &str) {
        info!(address, "peer address updated, re-targeting election strategy");
        let _ = self
            .engine_tx
            .send(EngineMsg::AddressUpdated(address.to_string()));
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.engine_tx.send(EngineMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
        self.shared.bus.unregister(&self.shared.self_address.name);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

type ObsId = u64;

struct ObserverRecord {
    name: String,
    callback: ObserveCallback,
    observer: Observer,
    observe_id: u64,
}

enum EngineMsg {
    Observe {
        name: String,
        callback: ObserveCallback,
        reply: oneshot::Sender<Observer>,
    },
    Reply(peer::ObserveResponse),
    CancelObserve(ObsId),
    AddressUpdated(String),
    Shutdown(oneshot::Sender<()>),
}

struct ObserveEngine {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    records: HashMap<ObsId, ObserverRecord>,
    pending_by_uuid: HashMap<String, ObsId>,
    ready: HashMap<u64, ObsId>,
    next_id: ObsId,
}

impl ObserveEngine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                EngineMsg::Observe {
                    name,
                    callback,
                    reply,
                } => {
                    let id = self.next_id;
                    self.next_id += 1;
                    let tx = self.tx.clone();
                    let observer = Observer::new(move || {
                        let _ = tx.send(EngineMsg::CancelObserve(id));
                    });
                    self.records.insert(
                        id,
                        ObserverRecord {
                            name,
                            callback,
                            observer: observer.clone(),
                            observe_id: 0,
                        },
                    );
                    self.send_observe(id);
                    let _ = reply.send(observer);
                }
                EngineMsg::Reply(response) => self.handle_reply(response),
                EngineMsg::CancelObserve(id) => self.handle_cancel(id),
                EngineMsg::AddressUpdated(address) => {
                    self.shared.target.write().node = address;
                    // re-create every live observation against the new peer
                    self.pending_by_uuid.clear();
                    self.ready.clear();
                    let ids = self.records.keys().copied().collect::<Vec<_>>();
                    for id in ids {
                        self.send_observe(id);
                    }
                }
                EngineMsg::Shutdown(reply) => {
                    for record in self.records.values() {
                        if record.observe_id != 0 && !record.observer.is_shut_down() {
                            self.send_cancel_request(record.observe_id);
                        }
                    }
                    self.records.clear();
                    self.pending_by_uuid.clear();
                    self.ready.clear();
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn send_observe(&mut self, id: ObsId) {
        let Some(record) = self.records.get(&id) else {
            return;
        };
        if record.observer.is_shut_down() {
            return;
        }
        let inner = election::LeaderRequest {
            name: prefix::prefix_key(&self.shared.table_prefix, &record.name),
        };
        let uuid = Uuid::new_v4().to_string();
        self.pending_by_uuid.insert(uuid.clone(), id);
        let payload = self.shared.envelope(&uuid, inner);
        info!(%uuid, name = %record.name, "sending observe to peer");
        let pending =
            self.shared
                .observe_tracker
                .begin(uuid.clone(), self.shared.target(), "Observe", payload);
        tokio::spawn(async move {
            if let Err(err) = pending.await {
                warn!(%uuid, "observe request got no reply: {err}");
            }
        });
    }

    fn handle_reply(&mut self, response: peer::ObserveResponse) {
        if response.is_create {
            self.on_create(response);
        } else if response.is_cancel {
            self.on_cancel(response);
        } else {
            self.on_event(response);
        }
    }

    fn on_create(&mut self, response: peer::ObserveResponse) {
        let Some(id) = self.pending_by_uuid.remove(&response.response_id) else {
            error!(response_id = %response.response_id, "created observe reply with no pending record");
            return;
        };
        let shut_down = match self.records.get(&id) {
            Some(record) => record.observer.is_shut_down(),
            None => return,
        };
        if shut_down {
            // honoured after the ack: drop the record and stop the peer side
            self.records.remove(&id);
            self.send_cancel_request(response.observe_id);
            return;
        }
        if let Some(record) = self.records.get_mut(&id) {
            record.observe_id = response.observe_id;
            self.ready.insert(response.observe_id, id);
            info!(observe_id = response.observe_id, name = %record.name, "observer created by peer");
        }
    }

    fn on_cancel(&mut self, response: peer::ObserveResponse) {
        let Some(&id) = self.ready.get(&response.observe_id) else {
            warn!(observe_id = response.observe_id, "cancel reply for unknown observer");
            return;
        };
        let shut_down = self
            .records
            .get(&id)
            .map(|record| record.observer.is_shut_down())
            .unwrap_or(true);
        if shut_down {
            info!(observe_id = response.observe_id, "observer cancel acknowledged by peer");
            self.ready.remove(&response.observe_id);
            self.records.remove(&id);
            return;
        }
        // server-initiated cancel: re-create the observation
        warn!(
            observe_id = response.observe_id,
            reason = %response.cancel_msg,
            "observer cancelled by peer, re-creating"
        );
        self.ready.remove(&response.observe_id);
        if let Some(record) = self.records.get_mut(&id) {
            record.observe_id = 0;
        }
        self.send_observe(id);
    }

    fn on_event(&mut self, response: peer::ObserveResponse) {
        let Some(&id) = self.ready.get(&response.observe_id) else {
            debug!(observe_id = response.observe_id, "event for unknown observer");
            return;
        };
        let Some(record) = self.records.get(&id) else {
            return;
        };
        if record.observer.is_shut_down() {
            debug!(observe_id = response.observe_id, "dropping event for shut down observer");
            return;
        }
        match election::LeaderResponse::decode(response.response_msg.as_slice()) {
            Ok(raw) => {
                let decoded = LeaderResponse::from_proto(&self.shared.table_prefix, raw);
                (record.callback)(decoded);
            }
            Err(err) => error!(observe_id = response.observe_id, "failed to parse leader event: {err}"),
        }
    }

    fn handle_cancel(&mut self, id: ObsId) {
        let observe_id = self.records.get(&id).map(|record| record.observe_id);
        match observe_id {
            Some(observe_id) if observe_id != 0 => {
                info!(observe_id, "cancelling observer");
                self.send_cancel_request(observe_id);
            }
            // still pending: dropped when the created ack arrives
            Some(_) => {}
            None => {}
        }
    }

    fn send_cancel_request(&self, observe_id: u64) {
        let request = peer::ObserveCancelRequest {
            cancel_observe_id: observe_id,
        };
        let request_id = Uuid::new_v4().to_string();
        let payload = self.shared.envelope(&request_id, request);
        if let Err(err) = self.shared.bus.send(
            &self.shared.self_address,
            &self.shared.target(),
            "CancelObserve",
            payload,
        ) {
            warn!(observe_id, "failed to send observe cancel: {err}");
        }
    }
}

async fn dispatch(
    mut inbox: mpsc::UnboundedReceiver<BusMessage>,
    shared: Arc<Shared>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
) {
    while let Some(message) = inbox.recv().await {
        match message.method.as_str() {
            "OnCampaign" => {
                let table_prefix = shared.table_prefix.clone();
                complete(&shared.campaign_tracker, &message.payload, move |raw| {
                    CampaignResponse::from_proto(&table_prefix, raw)
                });
            }
            "OnLeader" => {
                let table_prefix = shared.table_prefix.clone();
                complete(&shared.leader_tracker, &message.payload, move |raw| {
                    LeaderResponse::from_proto(&table_prefix, raw)
                });
            }
            "OnResign" => {
                complete(&shared.resign_tracker, &message.payload, ResignResponse::from_proto);
            }
            "OnObserve" => {
                let Ok(response) = peer::ObserveResponse::decode(message.payload.as_ref()) else {
                    error!("failed to parse observe reply");
                    continue;
                };
                if response.is_create {
                    shared.observe_tracker.end(&response.response_id, Ok(()));
                }
                let _ = engine_tx.send(EngineMsg::Reply(response));
            }
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
        error!("failed to parse election reply envelope");
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
