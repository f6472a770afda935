//! Direct maintenance strategy: a unary Status probe with a deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metastore_core::proto::rpc;
use metastore_core::StatusResponse;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::{MaintenanceStrategy, ReconnectedCallback};
use crate::channel::RpcChannel;
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};
use crate::grpc::MaintenanceClient;

pub struct EtcdMaintenanceStrategy {
    channel: RpcChannel,
    client: MaintenanceClient,
    options: TimeoutOptions,
    running: Arc<AtomicBool>,
    reconnecting: Arc<AtomicBool>,
    callback: Arc<RwLock<Option<ReconnectedCallback>>>,
}

impl EtcdMaintenanceStrategy {
    pub fn new(channel: RpcChannel, options: TimeoutOptions) -> Self {
        Self {
            client: MaintenanceClient::new(channel.channel()),
            channel,
            options,
            running: Arc::new(AtomicBool::new(true)),
            reconnecting: Arc::new(AtomicBool::new(false)),
            callback: Arc::new(RwLock::new(None)),
        }
    }

    /// Watch the transport in the background; fires the reconnected
    /// callback once it is healthy again. Only one watcher runs at a time.
    fn spawn_reconnect_watch(&self) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(address = %self.channel.address(), "maintenance probe failed, watching for reconnect");
        let channel = self.channel.clone();
        let running = self.running.clone();
        let reconnecting = self.reconnecting.clone();
        let callback = self.callback.clone();
        tokio::spawn(async move {
            let ok = channel.check_and_wait_for_reconnect(&running).await;
            reconnecting.store(false, Ordering::Release);
            if ok {
                info!(address = %channel.address(), "transport reconnected");
                let callback = callback.read().clone();
                if let Some(callback) = callback {
                    callback(channel.address().to_string());
                }
            }
        });
    }
}

#[async_trait]
impl MaintenanceStrategy for EtcdMaintenanceStrategy {
    async fn health_check(&self) -> Result<StatusResponse> {
        let mut client = self.client.clone();
        let mut request = tonic::Request::new(rpc::StatusRequest {});
        request.set_timeout(self.options.grpc_timeout());
        match client.status(request).await {
            Ok(response) => {
                let status = StatusResponse::from(response.into_inner());
                for error in &status.errors {
                    warn!(address = %self.channel.address(), error, "maintenance reported an alarm");
                }
                self.channel.mark_connected();
                Ok(status)
            }
            Err(status) => {
                self.channel.mark_disconnected();
                self.spawn_reconnect_watch();
                Err(Error::from_status(status))
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    fn bind_reconnected_callback(&self, callback: ReconnectedCallback) {
        *self.callback.write() = Some(callback);
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }
}
