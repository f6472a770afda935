//! Direct lease strategy.
//!
//! Grant and revoke are plain unary calls under the standard retry envelope
//! (without the unknown-error short-circuit). Keep-alives share a single
//! bidirectional stream created lazily on first use; replies are
//! demultiplexed by lease id and matched FIFO against the queued promises.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metastore_core::proto::rpc;
use metastore_core::{LeaseGrantResponse, LeaseKeepAliveResponse, LeaseRevokeResponse};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::LeaseStrategy;
use crate::channel::RpcChannel;
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::grpc::LeaseClient;
use crate::health::{HealthGate, HealthObserver, HealthStatus};
use crate::unary::retry_unary;

pub struct EtcdLeaseStrategy {
    channel: RpcChannel,
    lease: LeaseClient,
    options: TimeoutOptions,
    gate: HealthGate,
    running: Arc<AtomicBool>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
    engine_task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdLeaseStrategy {
    pub fn new(channel: RpcChannel, options: TimeoutOptions) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let engine = KeepAliveEngine {
            channel: channel.clone(),
            lease_client: LeaseClient::new(channel.channel()),
            running: running.clone(),
            tx: engine_tx.clone(),
            sink: None,
            reader: None,
            queues: HashMap::new(),
            reconnecting: false,
        };
        let engine_task = tokio::spawn(engine.run(engine_rx));
        Self {
            lease: LeaseClient::new(channel.channel()),
            channel,
            options,
            gate: HealthGate::new(),
            running,
            engine_tx,
            engine_task: Mutex::new(Some(engine_task)),
        }
    }
}

impl HealthObserver for EtcdLeaseStrategy {
    fn on_healthy_status(&self, status: HealthStatus) {
        warn!(?status, "updating lease client health status");
        self.gate.on_healthy_status(status);
    }
}

#[async_trait]
impl LeaseStrategy for EtcdLeaseStrategy {
    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        let client = self.lease.clone();
        let opts = self.options;
        let raw = retry_unary("Grant", &self.gate, &self.options, false, move |attempt| {
            let mut client = client.clone();
            async move {
                let mut outbound = tonic::Request::new(rpc::LeaseGrantRequest { ttl, id: 0 });
                outbound.set_timeout(opts.deadline(attempt));
                client
                    .lease_grant(outbound)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await?;
        debug!(lease_id = raw.id, ttl = raw.ttl, "lease granted");
        Ok(LeaseGrantResponse::from(raw))
    }

    async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse> {
        let client = self.lease.clone();
        let opts = self.options;
        let raw = retry_unary("Revoke", &self.gate, &self.options, false, move |attempt| {
            let mut client = client.clone();
            async move {
                let mut outbound = tonic::Request::new(rpc::LeaseRevokeRequest { id: lease_id });
                outbound.set_timeout(opts.deadline(attempt));
                client
                    .lease_revoke(outbound)
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await?;
        Ok(LeaseRevokeResponse::from(raw))
    }

    async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
        if let Some(detail) = self.gate.tripped() {
            return Err(Error::FallBreak(format!(
                "failed to call KeepAliveOnce: {detail}"
            )));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.engine_tx
            .send(EngineMsg::KeepAlive {
                lease_id,
                reply: reply_tx,
            })
            .map_err(|_| Error::Shutdown("keep-alive engine stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Shutdown("keep-alive engine stopped".into()))?
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

type Waiter = oneshot::Sender<Result<LeaseKeepAliveResponse>>;

enum EngineMsg {
    KeepAlive { lease_id: i64, reply: Waiter },
    Response(rpc::LeaseKeepAliveResponse),
    StreamLost,
    Reconnected(bool),
    Shutdown(oneshot::Sender<()>),
}

struct KeepAliveEngine {
    channel: RpcChannel,
    lease_client: LeaseClient,
    running: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    sink: Option<futures::channel::mpsc::UnboundedSender<rpc::LeaseKeepAliveRequest>>,
    reader: Option<JoinHandle<()>>,
    /// Per-lease FIFO of waiters; the head matches the next reply.
    queues: HashMap<i64, VecDeque<Waiter>>,
    reconnecting: bool,
}

impl KeepAliveEngine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                EngineMsg::KeepAlive { lease_id, reply } => {
                    self.handle_keep_alive(lease_id, reply).await
                }
                EngineMsg::Response(response) => self.handle_response(response),
                EngineMsg::StreamLost => self.handle_stream_lost(),
                EngineMsg::Reconnected(ok) => self.handle_reconnected(ok).await,
                EngineMsg::Shutdown(reply) => {
                    self.fail_all("lease client shutting down");
                    self.sink = None;
                    if let Some(reader) = self.reader.take() {
                        reader.abort();
                    }
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    async fn ensure_stream(&mut self) -> bool {
        if self.sink.is_some() {
            return true;
        }
        let (request_tx, request_rx) = futures::channel::mpsc::unbounded();
        match self
            .lease_client
            .clone()
            .lease_keep_alive(tonic::Request::new(request_rx))
            .await
        {
            Ok(response) => {
                let stream = response.into_inner();
                self.reader = Some(tokio::spawn(read_keep_alive_stream(
                    stream,
                    self.tx.clone(),
                    self.running.clone(),
                )));
                self.sink = Some(request_tx);
                self.channel.mark_connected();
                info!("lease keep-alive stream established");
                true
            }
            Err(status) => {
                warn!(%status, "failed to open keep-alive stream");
                self.channel.mark_disconnected();
                false
            }
        }
    }

    async fn handle_keep_alive(&mut self, lease_id: i64, reply: Waiter) {
        if !self.ensure_stream().await {
            let _ = reply.send(Err(Error::Unavailable(
                "keep-alive stream unavailable".into(),
            )));
            return;
        }
        self.queues.entry(lease_id).or_default().push_back(reply);
        let written = self
            .sink
            .as_ref()
            .is_some_and(|sink| {
                sink.unbounded_send(rpc::LeaseKeepAliveRequest { id: lease_id })
                    .is_ok()
            });
        if !written {
            self.sink = None;
            self.fail_all("keep alive write failure");
        }
    }

    fn handle_response(&mut self, response: rpc::LeaseKeepAliveResponse) {
        let lease_id = response.id;
        let Some(queue) = self.queues.get_mut(&lease_id) else {
            warn!(lease_id, "keep-alive reply with no queued waiter");
            return;
        };
        let Some(waiter) = queue.pop_front() else {
            warn!(lease_id, "keep-alive reply with empty waiter queue");
            return;
        };
        if queue.is_empty() {
            self.queues.remove(&lease_id);
        }
        if response.ttl == 0 {
            debug!(lease_id, "lease expired");
            let _ = waiter.send(Err(Error::LeaseExpired(lease_id)));
        } else {
            let _ = waiter.send(Ok(LeaseKeepAliveResponse::from(response)));
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
            info!("stopped reconnecting keep-alive stream");
            return;
        }
        if !self.ensure_stream().await {
            error!("failed to rebuild keep-alive stream after reconnect");
            self.handle_stream_lost();
            return;
        }
        // queued promises belong to the lost stream; their replies are gone
        self.fail_all("lease stream reconnect");
    }

    fn fail_all(&mut self, reason: &str) {
        let drained = self.queues.drain().collect::<Vec<_>>();
        if drained.is_empty() {
            return;
        }
        warn!(reason, "failing queued keep-alive promises");
        for (lease_id, queue) in drained {
            for waiter in queue {
                let _ = waiter.send(Err(Error::Unavailable(format!(
                    "keep alive for lease {lease_id} failed: {reason}"
                ))));
            }
        }
    }
}

async fn read_keep_alive_stream(
    mut stream: tonic::Streaming<rpc::LeaseKeepAliveResponse>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
) {
    debug!("keep-alive stream reader started");
    loop {
        match stream.message().await {
            Ok(Some(response)) => {
                if tx.send(EngineMsg::Response(response)).is_err() {
                    return;
                }
            }
            Ok(None) | Err(_) => {
                if running.load(Ordering::Acquire) {
                    warn!("keep-alive stream lost");
                    let _ = tx.send(EngineMsg::StreamLost);
                }
                return;
            }
        }
    }
}
