//! Leader acquisition.
//!
//! Two flavors hold a leader role on an election key: one over the
//! backend's election API (grant, keep-alive, campaign, observe), one over
//! a bare key with a create-if-absent transaction and a delete-triggered
//! re-election watch.

use async_trait::async_trait;
use metastore_client::kv::{Syncer, WatchObserver, Watcher};
use metastore_client::{MetastoreClient, Result};
use metastore_core::{
    CampaignResponse, GetOptions, GetResponse, LeaderKey, LeaseGrantResponse,
    LeaseKeepAliveResponse, LeaseRevokeResponse, ResignResponse, Txn, TxnResponse, WatchOptions,
};
use std::sync::Arc;
use std::time::Duration;

mod etcd;
mod txn;

pub use etcd::EtcdLeader;
pub use txn::TxnLeader;

/// Invoked when this process gains or loses leadership.
pub type LeadershipCallback = Arc<dyn Fn() + Send + Sync>;

/// Lease and cadence tuning for an elector.
#[derive(Clone, Debug)]
pub struct ElectionParams {
    /// The value proclaimed on winning, conventionally our address.
    pub proposal: String,
    /// Seconds the leadership lease lives without renewal.
    pub lease_ttl: i64,
    /// Cadence of keep-alive renewals; also the delay before re-running a
    /// failed election step.
    pub keep_alive_interval: Duration,
}

impl ElectionParams {
    pub fn new(proposal: impl Into<String>) -> Self {
        Self {
            proposal: proposal.into(),
            lease_ttl: 10,
            keep_alive_interval: Duration::from_secs(3),
        }
    }
}

/// The slice of the client surface electors consume; tests supply a fake.
#[async_trait]
pub trait ElectionApi: Send + Sync {
    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse>;
    async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse>;
    async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse>;
    async fn campaign(
        &self,
        name: &str,
        lease_id: i64,
        proposal: Vec<u8>,
    ) -> Result<CampaignResponse>;
    async fn resign(&self, leader: LeaderKey) -> Result<ResignResponse>;
    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse>;
    async fn commit(&self, txn: &Txn) -> Result<TxnResponse>;
    async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher>;
}

#[async_trait]
impl ElectionApi for MetastoreClient {
    async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        MetastoreClient::grant(self, ttl).await
    }

    async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse> {
        MetastoreClient::revoke(self, lease_id).await
    }

    async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
        MetastoreClient::keep_alive_once(self, lease_id).await
    }

    async fn campaign(
        &self,
        name: &str,
        lease_id: i64,
        proposal: Vec<u8>,
    ) -> Result<CampaignResponse> {
        MetastoreClient::campaign(self, name, lease_id, proposal).await
    }

    async fn resign(&self, leader: LeaderKey) -> Result<ResignResponse> {
        MetastoreClient::resign(self, leader).await
    }

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        MetastoreClient::get(self, key, options).await
    }

    async fn commit(&self, txn: &Txn) -> Result<TxnResponse> {
        MetastoreClient::commit(self, txn).await
    }

    async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        MetastoreClient::watch(self, key, options, observer, syncer).await
    }
}

/// A lease id that is not currently held.
pub(crate) const NO_LEASE: i64 = -1;
