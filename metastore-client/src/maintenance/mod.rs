//! The maintenance surface: health probes and the reconnected signal.

use std::sync::Arc;

use async_trait::async_trait;
use metastore_core::StatusResponse;

use crate::error::Result;

mod etcd;
mod proxy;

pub use etcd::EtcdMaintenanceStrategy;
pub use proxy::ProxyMaintenanceStrategy;

/// Invoked with the (possibly new) backend address after the transport or
/// the peer becomes reachable again.
pub type ReconnectedCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Uniform strategy surface for health checking one backend address.
#[async_trait]
pub trait MaintenanceStrategy: Send + Sync {
    /// One bounded status probe. Any failure kicks off the background
    /// reconnect watch; the bound callback fires when it succeeds.
    async fn health_check(&self) -> Result<StatusResponse>;

    async fn is_connected(&self) -> bool;

    fn bind_reconnected_callback(&self, callback: ReconnectedCallback);

    async fn shutdown(&self);
}
