//! Direct election strategy.
//!
//! Campaign intentionally carries no deadline: it blocks server-side until
//! leadership is acquired. Observers run a dedicated reader task over the
//! server-streaming Observe RPC and rebuild the stream after a fixed pause
//! on any read failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metastore_core::proto::election;
use metastore_core::{prefix, CampaignResponse, LeaderKey, LeaderResponse, ResignResponse};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{ElectionStrategy, ObserveCallback, Observer};
use crate::channel::RpcChannel;
use crate::config::TimeoutOptions;
use crate::error::Result;
use crate::grpc::ElectionClient;
use crate::health::{HealthGate, HealthObserver, HealthStatus};
use crate::unary::retry_unary;

/// Pause before rebuilding a failed observe stream.
const OBSERVE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct EtcdElectionStrategy {
    channel: RpcChannel,
    election: ElectionClient,
    table_prefix: String,
    options: TimeoutOptions,
    gate: HealthGate,
    running: Arc<AtomicBool>,
    observers: Mutex<Vec<JoinHandle<()>>>,
}

impl EtcdElectionStrategy {
    pub fn new(channel: RpcChannel, table_prefix: &str, options: TimeoutOptions) -> Self {
        Self {
            election: ElectionClient::new(channel.channel()),
            channel,
            table_prefix: table_prefix.to_string(),
            options,
            gate: HealthGate::new(),
            running: Arc::new(AtomicBool::new(true)),
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl HealthObserver for EtcdElectionStrategy {
    fn on_healthy_status(&self, status: HealthStatus) {
        warn!(?status, "updating election client health status");
        self.gate.on_healthy_status(status);
    }
}

#[async_trait]
impl ElectionStrategy for EtcdElectionStrategy {
    async fn campaign(
        &self,
        name: &str,
        lease_id: i64,
        proposal: Vec<u8>,
    ) -> Result<CampaignResponse> {
        let request = election::CampaignRequest {
            name: prefix::prefix_key(&self.table_prefix, name),
            lease: lease_id,
            value: proposal,
        };
        let client = self.election.clone();
        let raw = retry_unary("Campaign", &self.gate, &self.options, true, move |_attempt| {
            let mut client = client.clone();
            let request = request.clone();
            // no deadline: the call blocks until leadership is acquired
            async move {
                client
                    .campaign(tonic::Request::new(request))
                    .await
                    .map(tonic::Response::into_inner)
            }
        })
        .await?;
        debug!(name, "campaign succeeded");
        Ok(CampaignResponse::from_proto(&self.table_prefix, raw))
    }

    async fn leader(&self, name: &str) -> Result<LeaderResponse> {
        let request = election::LeaderRequest {
            name: prefix::prefix_key(&self.table_prefix, name),
        };
        let client = self.election.clone();
        let opts = self.options;
        let raw = retry_unary("Leader", &self.gate, &self.options, true, move |attempt| {
            let mut client = client.clone();
            let request = request.clone();
            async move {
                let mut outbound = tonic::Request::new(request);
                outbound.set_timeout(opts.deadline(attempt));
                client.leader(outbound).await.map(tonic::Response::into_inner)
            }
        })
        .await?;
        Ok(LeaderResponse::from_proto(&self.table_prefix, raw))
    }

    async fn resign(&self, leader: LeaderKey) -> Result<ResignResponse> {
        let request = election::ResignRequest {
            leader: Some(leader.to_proto(&self.table_prefix)),
        };
        let client = self.election.clone();
        let opts = self.options;
        let raw = retry_unary("Resign", &self.gate, &self.options, true, move |attempt| {
            let mut client = client.clone();
            let request = request.clone();
            async move {
                let mut outbound = tonic::Request::new(request);
                outbound.set_timeout(opts.deadline(attempt));
                client.resign(outbound).await.map(tonic::Response::into_inner)
            }
        })
        .await?;
        Ok(ResignResponse::from_proto(raw))
    }

    async fn observe(&self, name: &str, callback: ObserveCallback) -> Result<Observer> {
        let observing = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(observe_loop(
            self.election.clone(),
            self.table_prefix.clone(),
            name.to_string(),
            callback,
            observing.clone(),
            self.running.clone(),
        ));
        let abort = task.abort_handle();
        self.observers.lock().push(task);
        Ok(Observer::new(move || {
            observing.store(false, Ordering::Release);
            abort.abort();
        }))
    }

    async fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for task in self.observers.lock().drain(..) {
            task.abort();
        }
    }
}

async fn observe_loop(
    client: ElectionClient,
    table_prefix: String,
    name: String,
    callback: ObserveCallback,
    observing: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    info!(name, "observe stream reader started");
    let request = election::LeaderRequest {
        name: prefix::prefix_key(&table_prefix, &name),
    };
    while observing.load(Ordering::Acquire) && running.load(Ordering::Acquire) {
        let mut client = client.clone();
        match client.observe(tonic::Request::new(request.clone())).await {
            Ok(response) => {
                let mut stream = response.into_inner();
                loop {
                    if !observing.load(Ordering::Acquire) || !running.load(Ordering::Acquire) {
                        info!(name, "observe stream reader stopped");
                        return;
                    }
                    match stream.message().await {
                        Ok(Some(raw)) => {
                            callback(LeaderResponse::from_proto(&table_prefix, raw));
                        }
                        Ok(None) | Err(_) => {
                            warn!(name, "observe stream lost, rebuilding");
                            break;
                        }
                    }
                }
            }
            Err(status) => {
                warn!(name, %status, "failed to open observe stream");
            }
        }
        sleep(OBSERVE_RETRY_INTERVAL).await;
    }
    info!(name, "observe stream reader stopped");
}
