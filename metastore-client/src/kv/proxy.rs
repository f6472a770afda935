//! Proxied KV strategy: the same surface as the direct flavor, delivered as
//! UUID-tagged envelopes to the peer service over the message bus.
//!
//! Replies arrive asynchronously on the strategy's registered inbox; unary
//! replies complete their tracker entry, watch replies are forwarded to the
//! engine task which matches created-acks by uuid instead of write order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use metastore_core::proto::{peer, rpc};
use metastore_core::{
    prefix, DeleteOptions, DeleteResponse, GetOptions, GetResponse, PutOptions, PutResponse,
    TxnResponse, WatchEvent, WatchOptions,
};
use parking_lot::{Mutex, RwLock};
use prost::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::records::{RecordId, WatchSet};
use super::{KvStrategy, Syncer, WatchObserver, WatchRecord, Watcher, UNASSIGNED_WATCH_ID};
use crate::bus::{BusAddress, BusMessage, MessageBus};
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::health::{HealthGate, HealthObserver, HealthStatus};
use crate::retry::RequestTracker;

/// Actor name of the peer's KV accessor.
pub const KV_SERVICE_ACTOR: &str = "KvServiceAccessorActor";

struct Shared {
    bus: Arc<dyn MessageBus>,
    self_address: BusAddress,
    target: RwLock<BusAddress>,
    table_prefix: String,
    options: TimeoutOptions,
    gate: HealthGate,
    put_tracker: RequestTracker<PutResponse>,
    delete_tracker: RequestTracker<DeleteResponse>,
    get_tracker: RequestTracker<GetResponse>,
    txn_tracker: RequestTracker<rpc::TxnResponse>,
    watch_tracker: RequestTracker<()>,
}

impl Shared {
    fn target(&self) -> BusAddress {
        self.target.read().clone()
    }

    fn envelope(&self, request_id: &str, inner: impl Message, async_backup: bool) -> Bytes {
        let envelope = peer::MetaStoreRequest {
            request_id: request_id.to_string(),
            request_msg: inner.encode_to_vec(),
            async_backup,
        };
        envelope.encode_to_vec().into()
    }
}

pub struct ProxyKvStrategy {
    shared: Arc<Shared>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyKvStrategy {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        local_node: &str,
        peer_node: &str,
        table_prefix: &str,
        options: TimeoutOptions,
    ) -> Self {
        let name = format!("MetaStoreKvClient-{}", Uuid::new_v4());
        let self_address = BusAddress::new(name.clone(), local_node);
        let shared = Arc::new(Shared {
            target: RwLock::new(BusAddress::new(KV_SERVICE_ACTOR, peer_node)),
            table_prefix: table_prefix.to_string(),
            options,
            gate: HealthGate::new(),
            put_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            delete_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            get_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            txn_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            watch_tracker: RequestTracker::new(bus.clone(), self_address.clone(), options),
            self_address,
            bus,
        });

        let running = Arc::new(AtomicBool::new(true));
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = ProxyWatchEngine {
            shared: shared.clone(),
            tx: engine_tx.clone(),
            set: WatchSet::default(),
            seed: HashSet::new(),
            running: running.clone(),
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

    fn wire_key(&self, key: &str) -> Vec<u8> {
        prefix::prefix_key(&self.shared.table_prefix, key)
    }

    async fn watch_internal(
        &self,
        method: &'static str,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.engine_tx
            .send(EngineMsg::Watch {
                method,
                key: key.to_string(),
                options,
                observer: Some(observer),
                syncer,
                reconnect: None,
                reply: Some(reply_tx),
            })
            .map_err(|_| Error::Shutdown("watch engine stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Shutdown("watch engine stopped".into()))
    }
}

impl HealthObserver for ProxyKvStrategy {
    fn on_healthy_status(&self, status: HealthStatus) {
        warn!(?status, "updating proxied kv client health status");
        self.shared.gate.on_healthy_status(status);
    }
}

#[async_trait]
impl KvStrategy for ProxyKvStrategy {
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<PutResponse> {
        self.check_gate("Put")?;
        let inner = rpc::PutRequest {
            key: self.wire_key(key),
            value,
            lease: options.lease_id,
            prev_kv: options.prev_kv,
            ..Default::default()
        };
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, key, "sending put to peer");
        let payload = self.shared.envelope(&request_id, inner, options.async_backup);
        self.shared
            .put_tracker
            .begin(request_id, self.shared.target(), "Put", payload)
            .await
    }

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        self.check_gate("Get")?;
        let wire_key = self.wire_key(key);
        let range_end = if options.prefix {
            prefix::prefix_range_end(&wire_key)
        } else {
            Vec::new()
        };
        let inner = options.build_range(wire_key, range_end);
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, key, "sending get to peer");
        let payload = self.shared.envelope(&request_id, inner, true);
        self.shared
            .get_tracker
            .begin(request_id, self.shared.target(), "Get", payload)
            .await
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResponse> {
        self.check_gate("Delete")?;
        let wire_key = self.wire_key(key);
        let range_end = if options.prefix {
            prefix::prefix_range_end(&wire_key)
        } else {
            Vec::new()
        };
        let inner = rpc::DeleteRangeRequest {
            key: wire_key,
            range_end,
            prev_kv: options.prev_kv,
        };
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, key, "sending delete to peer");
        let payload = self.shared.envelope(&request_id, inner, options.async_backup);
        self.shared
            .delete_tracker
            .begin(request_id, self.shared.target(), "Delete", payload)
            .await
    }

    async fn commit_txn(&self, request: rpc::TxnRequest, async_backup: bool) -> Result<TxnResponse> {
        let raw = self.commit_raw(request, async_backup).await?;
        if raw.header.is_none() {
            return Err(Error::Unavailable("txn reply carried no header".into()));
        }
        Ok(TxnResponse::from_proto(&self.shared.table_prefix, raw))
    }

    async fn commit_raw(
        &self,
        request: rpc::TxnRequest,
        async_backup: bool,
    ) -> Result<rpc::TxnResponse> {
        self.check_gate("Txn")?;
        let request_id = Uuid::new_v4().to_string();
        debug!(%request_id, "sending txn to peer");
        let payload = self.shared.envelope(&request_id, request, async_backup);
        self.shared
            .txn_tracker
            .begin(request_id, self.shared.target(), "Txn", payload)
            .await
    }

    async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        self.watch_internal("Watch", key, options, observer, syncer)
            .await
    }

    async fn get_and_watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        if options.revision != 0 {
            return self
                .watch_internal("Watch", key, options, observer, syncer)
                .await;
        }
        self.watch_internal("GetAndWatch", key, options, observer, syncer)
            .await
    }

    async fn is_connected(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn on_address_updated(&self, address: &str) {
        info!(address, "peer address updated, re-targeting kv strategy");
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

enum EngineMsg {
    Watch {
        method: &'static str,
        key: String,
        options: WatchOptions,
        observer: Option<WatchObserver>,
        syncer: Option<Syncer>,
        reconnect: Option<RecordId>,
        reply: Option<oneshot::Sender<Watcher>>,
    },
    Reply {
        uuid: String,
        response: rpc::WatchResponse,
    },
    Cancel(i64),
    AddressUpdated(String),
    Shutdown(oneshot::Sender<()>),
}

struct ProxyWatchEngine {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    set: WatchSet,
    /// Records whose next event batch is the seeded state of a GetAndWatch
    /// and must be delivered with `synced == true`.
    seed: HashSet<RecordId>,
    running: Arc<AtomicBool>,
}

impl ProxyWatchEngine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                EngineMsg::Watch {
                    method,
                    key,
                    options,
                    observer,
                    syncer,
                    reconnect,
                    reply,
                } => self.handle_watch(method, key, options, observer, syncer, reconnect, reply),
                EngineMsg::Reply { uuid, response } => self.handle_reply(uuid, response).await,
                EngineMsg::Cancel(watch_id) => self.handle_cancel(watch_id),
                EngineMsg::AddressUpdated(address) => self.handle_address_updated(address).await,
                EngineMsg::Shutdown(reply) => {
                    self.finalize();
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn build_create(&self, key: &str, options: &WatchOptions) -> rpc::WatchRequest {
        let wire_key = prefix::prefix_key(&self.shared.table_prefix, key);
        let range_end = if options.prefix {
            prefix::prefix_range_end(&wire_key)
        } else {
            Vec::new()
        };
        rpc::WatchRequest {
            request_union: Some(rpc::watch_request::RequestUnion::CreateRequest(
                rpc::WatchCreateRequest {
                    key: wire_key,
                    range_end,
                    start_revision: options.revision,
                    prev_kv: options.prev_kv,
                    ..Default::default()
                },
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_watch(
        &mut self,
        method: &'static str,
        key: String,
        options: WatchOptions,
        mut observer: Option<WatchObserver>,
        syncer: Option<Syncer>,
        reconnect: Option<RecordId>,
        reply: Option<oneshot::Sender<Watcher>>,
    ) {
        let id = match reconnect {
            Some(id) if self.set.contains(id) => id,
            Some(_) => return,
            None => {
                let tx = self.tx.clone();
                let watcher = Watcher::new(move |watch_id| {
                    let _ = tx.send(EngineMsg::Cancel(watch_id));
                });
                let id = self.set.insert(WatchRecord {
                    key,
                    options,
                    observer: observer.take().unwrap_or_else(|| Box::new(|_, _| true)),
                    syncer,
                    watcher,
                    uuid: String::new(),
                });
                if method == "GetAndWatch" {
                    self.seed.insert(id);
                }
                id
            }
        };
        self.send_watch(method, id);
        if let Some(reply) = reply {
            if let Some(record) = self.set.get(id) {
                let _ = reply.send(record.watcher.clone());
            }
        }
    }

    /// Tag the record with a fresh uuid and hand the create request to the
    /// retry helper, which re-sends until any reply arrives.
    fn send_watch(&mut self, method: &'static str, id: RecordId) {
        let Some((key, options)) = self
            .set
            .get(id)
            .map(|record| (record.key.clone(), record.options.clone()))
        else {
            return;
        };
        let uuid = Uuid::new_v4().to_string();
        if let Some(record) = self.set.get_mut(id) {
            record.uuid = uuid.clone();
        }
        let request = self.build_create(&key, &options);
        self.set.set_pending_uuid(uuid.clone(), id);
        let payload = self.shared.envelope(&uuid, request, true);
        info!(%uuid, method, "sending watch create to peer");
        let pending = self
            .shared
            .watch_tracker
            .begin(uuid.clone(), self.shared.target(), method, payload);
        tokio::spawn(async move {
            if let Err(err) = pending.await {
                warn!(%uuid, "watch create request got no reply: {err}");
            }
        });
    }

    async fn handle_reply(&mut self, uuid: String, response: rpc::WatchResponse) {
        if response.created {
            self.on_create(&uuid, &response);
        } else if response.canceled {
            self.on_cancel(&response).await;
        } else {
            self.on_event(&response);
        }
    }

    fn on_create(&mut self, uuid: &str, response: &rpc::WatchResponse) {
        let Some(id) = self.set.take_pending_uuid(uuid) else {
            error!(%uuid, "created reply with no pending watcher");
            return;
        };
        let cancelled = self
            .set
            .get(id)
            .map(|record| record.watcher.is_cancelled())
            .unwrap_or(true);
        if cancelled {
            warn!(%uuid, watch_id = response.watch_id, "watcher was cancelled while pending");
            self.send_cancel_request(response.watch_id);
            return;
        }
        if let Some(record) = self.set.get(id) {
            record.watcher.set_watch_id(response.watch_id);
            let key = record.key.clone();
            self.set.bind_ready(response.watch_id, id);
            info!(%uuid, watch_id = response.watch_id, key = %key, "watcher created by peer");
        }
    }

    fn on_event(&mut self, response: &rpc::WatchResponse) {
        let Some(id) = self.set.ready_record(response.watch_id) else {
            error!(watch_id = response.watch_id, "events for unknown watcher");
            return;
        };
        if self
            .set
            .get(id)
            .map(|record| record.watcher.is_cancelled())
            .unwrap_or(true)
        {
            self.set.unbind_ready(response.watch_id);
            return;
        }
        let synced = self.seed.remove(&id);
        let events = WatchEvent::from_response(&self.shared.table_prefix, response);
        let revision = response.header.as_ref().map(|h| h.revision).unwrap_or(0);
        if let Some(record) = self.set.get_mut(id) {
            record.options.revision = revision + 1;
            record.notify(events, synced);
        }
    }

    async fn on_cancel(&mut self, response: &rpc::WatchResponse) {
        let watch_id = response.watch_id;
        let Some(id) = self.set.ready_record(watch_id) else {
            error!(watch_id, "cancel reply for unknown watcher");
            return;
        };
        let cancelled = self
            .set
            .get(id)
            .map(|record| record.watcher.is_cancelled())
            .unwrap_or(true);
        if cancelled {
            info!(watch_id, "watcher cancel acknowledged by peer");
            self.set.unbind_ready(watch_id);
            return;
        }
        let start_revision = self
            .set
            .get(id)
            .map(|record| record.options.revision)
            .unwrap_or(0);
        warn!(
            watch_id,
            compact_revision = response.compact_revision,
            start_revision,
            "watcher cancelled by peer"
        );
        self.set.unbind_ready(watch_id);
        if response.compact_revision > start_revision {
            self.sync_record(id).await;
        }
        if let Some(record) = self.set.get(id) {
            record.watcher.reset();
        }
        self.send_watch("Watch", id);
    }

    async fn sync_record(&mut self, id: RecordId) {
        let sync = self
            .set
            .get(id)
            .and_then(|record| record.syncer.as_ref().map(|syncer| syncer()));
        if let Some(future) = sync {
            match future.await {
                Some(result) => {
                    if let Some(record) = self.set.get_mut(id) {
                        record.options.revision = result.revision;
                        info!(key = %record.key, revision = result.revision, "record resynced");
                    }
                }
                None => warn!("record resync failed, keeping previous revision"),
            }
        }
    }

    fn handle_cancel(&mut self, watch_id: i64) {
        self.set.prune_cancelled();
        if watch_id != UNASSIGNED_WATCH_ID {
            info!(watch_id, "cancelling proxied watcher");
            self.send_cancel_request(watch_id);
        }
    }

    fn send_cancel_request(&self, watch_id: i64) {
        let request = rpc::WatchRequest {
            request_union: Some(rpc::watch_request::RequestUnion::CancelRequest(
                rpc::WatchCancelRequest { watch_id },
            )),
        };
        let request_id = Uuid::new_v4().to_string();
        let payload = self.shared.envelope(&request_id, request, true);
        if let Err(err) = self.shared.bus.send(
            &self.shared.self_address,
            &self.shared.target(),
            "CancelWatch",
            payload,
        ) {
            warn!(watch_id, "failed to send watch cancel: {err}");
        }
    }

    /// The peer moved: resync every record, then re-create every watch
    /// against the new address.
    async fn handle_address_updated(&mut self, address: String) {
        {
            let mut target = self.shared.target.write();
            target.node = address;
        }
        for id in self.set.active_ids() {
            self.sync_record(id).await;
        }
        self.set.clear_pending();
        self.set.clear_ready();
        let ids = self.set.active_ids();
        info!(records = ids.len(), "re-watching records against new peer");
        for id in ids {
            if let Some(record) = self.set.get(id) {
                record.watcher.reset();
            }
            self.send_watch("Watch", id);
        }
    }

    fn finalize(&mut self) {
        for watch_id in self.set.ready_watch_ids() {
            self.send_cancel_request(watch_id);
        }
        self.set.clear();
        self.seed.clear();
        info!("proxied watch engine stopped");
    }
}

async fn dispatch(
    mut inbox: mpsc::UnboundedReceiver<BusMessage>,
    shared: Arc<Shared>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
) {
    while let Some(message) = inbox.recv().await {
        match message.method.as_str() {
            "OnPut" => {
                let table_prefix = shared.table_prefix.clone();
                complete(&shared.put_tracker, &message.payload, move |raw| {
                    PutResponse::from_proto(&table_prefix, raw)
                });
            }
            "OnDelete" => {
                let table_prefix = shared.table_prefix.clone();
                complete(&shared.delete_tracker, &message.payload, move |raw| {
                    DeleteResponse::from_proto(&table_prefix, raw)
                });
            }
            "OnGet" => {
                let table_prefix = shared.table_prefix.clone();
                complete(&shared.get_tracker, &message.payload, move |raw| {
                    GetResponse::from_proto(&table_prefix, raw)
                });
            }
            "OnTxn" => {
                complete(&shared.txn_tracker, &message.payload, |raw: rpc::TxnResponse| raw);
            }
            "OnWatch" | "OnGetAndWatch" | "OnCancelWatch" => {
                let Ok(envelope) = peer::MetaStoreResponse::decode(message.payload.as_ref()) else {
                    error!("failed to parse watch reply envelope");
                    continue;
                };
                let Ok(response) = rpc::WatchResponse::decode(envelope.response_msg.as_slice())
                else {
                    error!(response_id = %envelope.response_id, "failed to parse inner watch response");
                    continue;
                };
                if response.created {
                    // any reply stops the create re-send loop
                    shared.watch_tracker.end(&envelope.response_id, Ok(()));
                }
                let _ = engine_tx.send(EngineMsg::Reply {
                    uuid: envelope.response_id,
                    response,
                });
            }
            other => debug!(method = other, "ignoring unexpected bus message"),
        }
    }
}

/// Decode a unary reply envelope and complete its tracker entry.
fn complete<T, R>(tracker: &RequestTracker<R>, payload: &[u8], decode: impl FnOnce(T) -> R)
where
    T: Message + Default,
    R: Send + 'static,
{
    let Ok(envelope) = peer::MetaStoreResponse::decode(payload) else {
        error!("failed to parse reply envelope");
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
