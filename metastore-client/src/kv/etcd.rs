//! Direct KV strategy: unary calls plus the shared watch stream.
//!
//! All watches multiplex one bidirectional stream. A dedicated reader task
//! blocks on the stream and posts every message to the engine task, which
//! owns the record bookkeeping: the pending FIFO awaiting created-acks, the
//! ready map, compaction-aware resync, and the re-watch cycle after a
//! transport reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metastore_core::proto::rpc;
use metastore_core::{
    prefix, DeleteOptions, DeleteResponse, GetOptions, GetResponse, PutOptions, PutResponse,
    TxnResponse, WatchEvent, WatchOptions,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::records::{RecordId, WatchSet};
use super::{KvStrategy, Syncer, WatchObserver, WatchRecord, Watcher, UNASSIGNED_WATCH_ID};
use crate::channel::RpcChannel;
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::grpc::{KvClient, WatchClient};
use crate::health::{HealthGate, HealthObserver, HealthStatus};
use crate::unary::retry_unary;

/// Delay before re-attempting a keep-retry watch that could not be written.
const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct EtcdKvStrategy {
    channel: RpcChannel,
    kv: KvClient,
    table_prefix: String,
    options: TimeoutOptions,
    gate: HealthGate,
    running: Arc<AtomicBool>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
    engine_task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdKvStrategy {
    pub fn new(channel: RpcChannel, table_prefix: &str, options: TimeoutOptions) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = WatchEngine {
            channel: channel.clone(),
            watch_client: WatchClient::new(channel.channel()),
            table_prefix: table_prefix.to_string(),
            running: running.clone(),
            tx: engine_tx.clone(),
            sink: None,
            reader: None,
            set: WatchSet::default(),
            reconnecting: false,
        };
        let engine_task = tokio::spawn(engine.run(engine_rx));
        Self {
            kv: KvClient::new(channel.channel()),
            channel,
            table_prefix: table_prefix.to_string(),
            options,
            gate: HealthGate::new(),
            running,
            engine_tx,
            engine_task: Mutex::new(Some(engine_task)),
        }
    }

    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    fn wire_key(&self, key: &str) -> Vec<u8> {
        prefix::prefix_key(&self.table_prefix, key)
    }
}

impl HealthObserver for EtcdKvStrategy {
    fn on_healthy_status(&self, status: HealthStatus) {
        warn!(?status, "updating kv client health status");
        self.gate.on_healthy_status(status);
    }
}

#[async_trait]
impl KvStrategy for EtcdKvStrategy {
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<PutResponse> {
        let request = rpc::PutRequest {
            key: self.wire_key(key),
            value,
            lease: options.lease_id,
            prev_kv: options.prev_kv,
            ..Default::default()
        };
        let client = self.kv.clone();
        let opts = self.options;
        let raw = retry_unary("Put", &self.gate, &self.options, true, move |attempt| {
            let mut client = client.clone();
            let request = request.clone();
            async move {
                let mut outbound = tonic::Request::new(request);
                outbound.set_timeout(opts.deadline(attempt));
                client.put(outbound).await.map(tonic::Response::into_inner)
            }
        })
        .await?;
        Ok(PutResponse::from_proto(&self.table_prefix, raw))
    }

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        let wire_key = self.wire_key(key);
        let range_end = if options.prefix {
            prefix::prefix_range_end(&wire_key)
        } else {
            Vec::new()
        };
        let request = options.build_range(wire_key, range_end);
        let client = self.kv.clone();
        let opts = self.options;
        let raw = retry_unary("Get", &self.gate, &self.options, true, move |attempt| {
            let mut client = client.clone();
            let request = request.clone();
            async move {
                let mut outbound = tonic::Request::new(request);
                outbound.set_timeout(opts.deadline(attempt));
                client.range(outbound).await.map(tonic::Response::into_inner)
            }
        })
        .await?;
        Ok(GetResponse::from_proto(&self.table_prefix, raw))
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResponse> {
        let wire_key = self.wire_key(key);
        let range_end = if options.prefix {
            prefix::prefix_range_end(&wire_key)
        } else {
            Vec::new()
        };
        let request = rpc::DeleteRangeRequest {
            key: wire_key,
            range_end,
            prev_kv: options.prev_kv,
        };
        let client = self.kv.clone();
        let opts = self.options;
        let raw = retry_unary("Delete", &self.gate, &self.options, true, move |attempt| {
            let mut client = client.clone();
            let request = request.clone();
            async move {
                let mut outbound = tonic::Request::new(request);
                outbound.set_timeout(opts.deadline(attempt));
                client
                    .delete_range(outbound)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await?;
        debug!(key, deleted = raw.deleted, "delete finished");
        Ok(DeleteResponse::from_proto(&self.table_prefix, raw))
    }

    async fn commit_txn(&self, request: rpc::TxnRequest, async_backup: bool) -> Result<TxnResponse> {
        let raw = self.commit_raw(request, async_backup).await?;
        if raw.header.is_none() {
            return Err(Error::Unavailable("txn reply carried no header".into()));
        }
        Ok(TxnResponse::from_proto(&self.table_prefix, raw))
    }

    async fn commit_raw(
        &self,
        request: rpc::TxnRequest,
        _async_backup: bool,
    ) -> Result<rpc::TxnResponse> {
        let client = self.kv.clone();
        let opts = self.options;
        retry_unary("Txn", &self.gate, &self.options, true, move |attempt| {
            let mut client = client.clone();
            let request = request.clone();
            async move {
                let mut outbound = tonic::Request::new(request);
                outbound.set_timeout(opts.deadline(attempt));
                client.txn(outbound).await.map(tonic::Response::into_inner)
            }
        })
        .await
    }

    async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.engine_tx
            .send(EngineMsg::Watch(WatchStart {
                key: key.to_string(),
                options,
                observer: Some(observer),
                syncer,
                reconnect: None,
                reply: Some(reply_tx),
            }))
            .map_err(|_| Error::Shutdown("watch engine stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Shutdown("watch engine stopped".into()))
    }

    async fn get_and_watch(
        &self,
        key: &str,
        options: WatchOptions,
        mut observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        if options.revision != 0 {
            return self.watch(key, options, observer, syncer).await;
        }
        let get = self
            .get(
                key,
                GetOptions {
                    prefix: options.prefix,
                    ..Default::default()
                },
            )
            .await?;
        let events = get
            .kvs
            .iter()
            .cloned()
            .map(|kv| WatchEvent {
                event_type: metastore_core::EventType::Put,
                kv,
                prev_kv: None,
            })
            .collect::<Vec<_>>();
        debug!(key, events = events.len(), "seeding observer from get response");
        observer(events, true);
        let watch_options = options.starting_at(get.header.revision + 1);
        self.watch(key, watch_options, observer, syncer).await
    }

    async fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.engine_tx.send(EngineMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
        let task = self.engine_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// A watch registration travelling to the engine; `reconnect` re-uses an
/// existing record instead of allocating one.
struct WatchStart {
    key: String,
    options: WatchOptions,
    observer: Option<WatchObserver>,
    syncer: Option<Syncer>,
    reconnect: Option<RecordId>,
    reply: Option<oneshot::Sender<Watcher>>,
}

impl WatchStart {
    fn rewatch(id: RecordId) -> Self {
        Self {
            key: String::new(),
            options: WatchOptions::default(),
            observer: None,
            syncer: None,
            reconnect: Some(id),
            reply: None,
        }
    }
}

enum EngineMsg {
    Watch(WatchStart),
    Cancel(i64),
    Stream(rpc::WatchResponse),
    StreamLost,
    Reconnected(bool),
    Shutdown(oneshot::Sender<()>),
}

struct WatchEngine {
    channel: RpcChannel,
    watch_client: WatchClient,
    table_prefix: String,
    running: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    sink: Option<futures::channel::mpsc::UnboundedSender<rpc::WatchRequest>>,
    reader: Option<JoinHandle<()>>,
    set: WatchSet,
    reconnecting: bool,
}

impl WatchEngine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                EngineMsg::Watch(start) => self.handle_watch(start).await,
                EngineMsg::Cancel(watch_id) => self.handle_cancel(watch_id),
                EngineMsg::Stream(response) => self.handle_stream(response).await,
                EngineMsg::StreamLost => self.handle_stream_lost(),
                EngineMsg::Reconnected(ok) => self.handle_reconnected(ok).await,
                EngineMsg::Shutdown(reply) => {
                    self.finalize();
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn build_create(&self, key: &str, options: &WatchOptions) -> rpc::WatchRequest {
        let wire_key = prefix::prefix_key(&self.table_prefix, key);
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

    async fn ensure_stream(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        let (request_tx, request_rx) = futures::channel::mpsc::unbounded();
        match self
            .watch_client
            .clone()
            .watch(tonic::Request::new(request_rx))
            .await
        {
            Ok(response) => {
                let stream = response.into_inner();
                self.reader = Some(tokio::spawn(read_watch_stream(
                    stream,
                    self.tx.clone(),
                    self.running.clone(),
                )));
                self.sink = Some(request_tx);
                self.channel.mark_connected();
                info!("watch stream established");
                true
            }
            Err(status) => {
                warn!(%status, "failed to open watch stream");
                self.channel.mark_disconnected();
                false
            }
        }
    }

    async fn handle_watch(&mut self, mut start: WatchStart) {
        if !self.running.load(Ordering::Acquire) {
            if let Some(reply) = start.reply.take() {
                let _ = reply.send(Watcher::detached());
            }
            return;
        }
        let (key, options) = match start.reconnect {
            Some(id) => match self.set.get(id) {
                Some(record) if !record.watcher.is_cancelled() => {
                    (record.key.clone(), record.options.clone())
                }
                _ => {
                    if let Some(reply) = start.reply.take() {
                        let _ = reply.send(Watcher::detached());
                    }
                    return;
                }
            },
            None => (start.key.clone(), start.options.clone()),
        };

        if !self.ensure_stream().await || !self.channel.is_connected() {
            return self.retry_watch(start);
        }

        let request = self.build_create(&key, &options);
        let written = self
            .sink
            .as_ref()
            .is_some_and(|sink| sink.unbounded_send(request).is_ok());
        if !written {
            self.sink = None;
            warn!(key = %key, "failed to write watch create request");
            return self.retry_watch(start);
        }
        info!(key = %key, revision = options.revision, "watch create request written");

        let id = match start.reconnect {
            Some(id) => id,
            None => {
                let tx = self.tx.clone();
                let watcher = Watcher::new(move |watch_id| {
                    let _ = tx.send(EngineMsg::Cancel(watch_id));
                });
                self.set.insert(WatchRecord {
                    key,
                    options,
                    observer: start.observer.take().unwrap_or_else(|| Box::new(|_, _| true)),
                    syncer: start.syncer.take(),
                    watcher,
                    uuid: String::new(),
                })
            }
        };
        self.set.push_pending(id);
        if let Some(reply) = start.reply.take() {
            if let Some(record) = self.set.get(id) {
                let _ = reply.send(record.watcher.clone());
            }
        }
    }

    /// Disconnected or the write failed: fail fast for ordinary watches,
    /// schedule a delayed re-attempt for keep-retry ones.
    fn retry_watch(&mut self, mut start: WatchStart) {
        let keep_retry = match start.reconnect {
            Some(id) => self
                .set
                .get(id)
                .map(|record| record.options.keep_retry)
                .unwrap_or(false),
            None => start.options.keep_retry,
        };
        if !keep_retry {
            info!(key = %start.key, "watch attempt failed without keep-retry");
            if let Some(reply) = start.reply.take() {
                let _ = reply.send(Watcher::detached());
            }
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(WATCH_RETRY_INTERVAL).await;
            let _ = tx.send(EngineMsg::Watch(start));
        });
    }

    async fn handle_stream(&mut self, response: rpc::WatchResponse) {
        if response.created {
            self.on_create(&response);
        } else if response.canceled {
            self.on_cancel(&response).await;
        } else {
            self.on_event(&response);
        }
    }

    fn on_create(&mut self, response: &rpc::WatchResponse) {
        let Some(id) = self.set.pop_pending() else {
            error!(watch_id = response.watch_id, "created ack with no pending watcher");
            return;
        };
        let cancelled = self
            .set
            .get(id)
            .map(|record| record.watcher.is_cancelled())
            .unwrap_or(true);
        if cancelled {
            // Cancellation while pending: drop before ready, and stop the
            // server-side watch now that the id is known.
            warn!(watch_id = response.watch_id, "watcher was cancelled while pending");
            self.send_cancel_request(response.watch_id);
            return;
        }
        if let Some(record) = self.set.get(id) {
            record.watcher.set_watch_id(response.watch_id);
            let key = record.key.clone();
            self.set.bind_ready(response.watch_id, id);
            info!(watch_id = response.watch_id, key = %key, "watcher created");
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
            warn!(watch_id = response.watch_id, "events on cancelled watcher");
            self.set.unbind_ready(response.watch_id);
            return;
        }
        let events = WatchEvent::from_response(&self.table_prefix, response);
        let revision = response.header.as_ref().map(|h| h.revision).unwrap_or(0);
        if let Some(record) = self.set.get_mut(id) {
            // the next re-watch must resume past this batch
            record.options.revision = revision + 1;
            debug!(
                watch_id = response.watch_id,
                events = events.len(),
                revision,
                "delivering watch events"
            );
            record.notify(events, false);
        }
    }

    async fn on_cancel(&mut self, response: &rpc::WatchResponse) {
        let watch_id = response.watch_id;
        let Some(id) = self.set.ready_record(watch_id) else {
            error!(watch_id, "cancel ack for unknown watcher");
            return;
        };
        let cancelled = self
            .set
            .get(id)
            .map(|record| record.watcher.is_cancelled())
            .unwrap_or(true);
        if cancelled {
            info!(watch_id, "watcher cancel acknowledged");
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
            reason = %response.cancel_reason,
            compact_revision = response.compact_revision,
            start_revision,
            "watcher cancelled by server"
        );
        self.set.unbind_ready(watch_id);

        if response.compact_revision > start_revision {
            // the watch window was compacted away; resync before resuming
            let sync = self
                .set
                .get(id)
                .and_then(|record| record.syncer.as_ref().map(|syncer| syncer()));
            if let Some(future) = sync {
                match future.await {
                    Some(result) => {
                        if let Some(record) = self.set.get_mut(id) {
                            record.options.revision = result.revision;
                            info!(watch_id, revision = result.revision, "resynced after compaction");
                        }
                    }
                    None => warn!(watch_id, "resync failed, keeping previous revision"),
                }
            }
        }

        if let Some(record) = self.set.get(id) {
            record.watcher.reset();
        }
        let _ = self.tx.send(EngineMsg::Watch(WatchStart::rewatch(id)));
    }

    fn handle_cancel(&mut self, watch_id: i64) {
        self.set.prune_cancelled();
        if watch_id != UNASSIGNED_WATCH_ID {
            info!(watch_id, "cancelling watcher");
            self.send_cancel_request(watch_id);
        }
    }

    fn send_cancel_request(&mut self, watch_id: i64) {
        if let Some(sink) = &self.sink {
            let request = rpc::WatchRequest {
                request_union: Some(rpc::watch_request::RequestUnion::CancelRequest(
                    rpc::WatchCancelRequest { watch_id },
                )),
            };
            if sink.unbounded_send(request).is_err() {
                self.sink = None;
            }
        }
    }

    fn handle_stream_lost(&mut self) {
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.reconnecting || !self.running.load(Ordering::Acquire) {
            return;
        }
        self.reconnecting = true;
        let channel = self.channel.clone();
        let running = self.running.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let ok = channel.check_and_wait_for_reconnect(&running).await;
            let _ = tx.send(EngineMsg::Reconnected(ok));
        });
    }

    async fn handle_reconnected(&mut self, ok: bool) {
        self.reconnecting = false;
        if !ok || !self.running.load(Ordering::Acquire) {
            info!("stopped reconnecting watch stream");
            return;
        }
        self.set.clear_pending();
        if !self.ensure_stream().await {
            error!("failed to rebuild watch stream after reconnect");
            self.handle_stream_lost();
            return;
        }
        self.set.clear_ready();
        let ids = self.set.active_ids();
        info!(records = ids.len(), "re-watching records after reconnect");
        for id in ids {
            if let Some(record) = self.set.get(id) {
                info!(key = %record.key, revision = record.options.revision, "re-watching key");
                record.watcher.reset();
            }
            let _ = self.tx.send(EngineMsg::Watch(WatchStart::rewatch(id)));
        }
    }

    fn finalize(&mut self) {
        for watch_id in self.set.ready_watch_ids() {
            self.send_cancel_request(watch_id);
        }
        self.set.clear();
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        info!("watch engine stopped");
    }
}

async fn read_watch_stream(
    mut stream: tonic::Streaming<rpc::WatchResponse>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
) {
    debug!("watch stream reader started");
    loop {
        match stream.message().await {
            Ok(Some(response)) => {
                if tx.send(EngineMsg::Stream(response)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                if running.load(Ordering::Acquire) {
                    warn!("watch stream closed by server");
                    let _ = tx.send(EngineMsg::StreamLost);
                }
                return;
            }
            Err(status) => {
                if running.load(Ordering::Acquire) {
                    warn!(%status, "watch stream read failed");
                    let _ = tx.send(EngineMsg::StreamLost);
                }
                return;
            }
        }
    }
}
