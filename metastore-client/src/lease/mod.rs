//! The lease surface: grant/revoke plus the keep-alive stream.

use async_trait::async_trait;
use metastore_core::{LeaseGrantResponse, LeaseKeepAliveResponse, LeaseRevokeResponse};

use crate::error::Result;
use crate::health::HealthObserver;

mod etcd;
mod proxy;

pub use etcd::EtcdLeaseStrategy;
pub use proxy::ProxyLeaseStrategy;

/// Uniform strategy surface for the lease service.
#[async_trait]
pub trait LeaseStrategy: HealthObserver {
    /// Grant a lease with the given time-to-live in seconds.
    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse>;

    /// Refresh a lease once. A reply with `ttl == 0` surfaces as
    /// [`crate::Error::LeaseExpired`].
    async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse>;

    async fn is_connected(&self) -> bool;

    fn on_address_updated(&self, _address: &str) {}

    async fn shutdown(&self);
}
