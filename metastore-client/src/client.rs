//! The client facade: instantiates the strategy set the configuration asks
//! for and routes every operation to the direct or proxied flavor.

use std::sync::Arc;
use std::time::Duration;

use metastore_core::proto::rpc;
use metastore_core::{
    CampaignResponse, DeleteOptions, DeleteResponse, GetOptions, GetResponse, LeaderKey,
    LeaderResponse, LeaseGrantResponse, LeaseKeepAliveResponse, LeaseRevokeResponse, PutOptions,
    PutResponse, ResignResponse, StatusResponse, Txn, TxnResponse, WatchOptions,
};
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::channel::{RpcChannel, BALANCE_FALLBACK_TIMEOUT};
use crate::config::{Config, RoutingMode};
use crate::election::{
    ElectionStrategy, EtcdElectionStrategy, ObserveCallback, Observer, ProxyElectionStrategy,
};
use crate::error::{Error, Result};
use crate::health::{HealthObserver, HealthStatus};
use crate::kv::{EtcdKvStrategy, KvStrategy, ProxyKvStrategy, Syncer, WatchObserver, Watcher};
use crate::lease::{EtcdLeaseStrategy, LeaseStrategy, ProxyLeaseStrategy};
use crate::maintenance::{
    EtcdMaintenanceStrategy, MaintenanceStrategy, ProxyMaintenanceStrategy, ReconnectedCallback,
};

/// Bound on the initial connectivity probe at construction time.
const INITIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Node name strategies register under on the local bus.
const LOCAL_NODE: &str = "local";

struct DirectSet {
    channel: RpcChannel,
    kv: Arc<EtcdKvStrategy>,
    lease: Arc<EtcdLeaseStrategy>,
    election: Arc<EtcdElectionStrategy>,
    maintenance: Arc<EtcdMaintenanceStrategy>,
}

struct ProxySet {
    kv: Arc<ProxyKvStrategy>,
    lease: Arc<ProxyLeaseStrategy>,
    election: Option<Arc<ProxyElectionStrategy>>,
    maintenance: Arc<ProxyMaintenanceStrategy>,
}

/// A uniform client over the KV / lease / election / maintenance surfaces,
/// talking either straight to the backend or to a peer service over the
/// message bus, with per-key routing between the two.
pub struct MetastoreClient {
    config: Config,
    direct: Option<DirectSet>,
    proxied: Option<ProxySet>,
}

impl MetastoreClient {
    /// Build the strategy set `config` asks for. Proxy-mode configs need a
    /// bus to reach the peer service.
    pub async fn new(config: Config, bus: Option<Arc<dyn MessageBus>>) -> Result<Self> {
        let mode = config.routing_mode();
        info!(?mode, "initializing metastore client");

        // The direct set also backs election when passthrough is off.
        let needs_direct = !config.enable_meta_store || !config.is_meta_store_passthrough;
        let direct = if needs_direct {
            if config.etcd_address.is_empty() {
                return Err(Error::InvalidParameter(
                    "etcd address required for direct strategies".into(),
                ));
            }
            let channel = RpcChannel::new(&config.etcd_address, config.tls.as_ref())?;
            // a balanced set gets the fixed fallback budget to find any
            // reachable endpoint
            let initial_probe = if channel.is_balanced() {
                BALANCE_FALLBACK_TIMEOUT
            } else {
                INITIAL_CONNECT_TIMEOUT
            };
            if !channel.wait_for_connected(initial_probe).await {
                warn!(address = %config.etcd_address, "backend not reachable yet, continuing");
            }
            Some(DirectSet {
                kv: Arc::new(EtcdKvStrategy::new(
                    channel.clone(),
                    &config.etcd_table_prefix,
                    config.timeouts,
                )),
                lease: Arc::new(EtcdLeaseStrategy::new(channel.clone(), config.timeouts)),
                election: Arc::new(EtcdElectionStrategy::new(
                    channel.clone(),
                    &config.etcd_table_prefix,
                    config.timeouts,
                )),
                maintenance: Arc::new(EtcdMaintenanceStrategy::new(
                    channel.clone(),
                    config.timeouts,
                )),
                channel,
            })
        } else {
            None
        };

        let proxied = if config.enable_meta_store {
            let bus = bus.ok_or_else(|| {
                Error::InvalidParameter("proxy mode requires a message bus".into())
            })?;
            if config.meta_store_address.is_empty() {
                return Err(Error::InvalidParameter(
                    "meta store address required for proxy strategies".into(),
                ));
            }
            let election = if config.is_meta_store_passthrough {
                Some(Arc::new(ProxyElectionStrategy::new(
                    bus.clone(),
                    LOCAL_NODE,
                    &config.meta_store_address,
                    &config.etcd_table_prefix,
                    config.timeouts,
                )))
            } else {
                None
            };
            Some(ProxySet {
                kv: Arc::new(ProxyKvStrategy::new(
                    bus.clone(),
                    LOCAL_NODE,
                    &config.meta_store_address,
                    &config.etcd_table_prefix,
                    config.timeouts,
                )),
                lease: Arc::new(ProxyLeaseStrategy::new(
                    bus.clone(),
                    LOCAL_NODE,
                    &config.meta_store_address,
                    config.timeouts,
                )),
                election,
                maintenance: Arc::new(ProxyMaintenanceStrategy::new(
                    bus,
                    LOCAL_NODE,
                    &config.meta_store_address,
                    config.timeouts,
                )),
            })
        } else {
            None
        };

        Ok(Self {
            config,
            direct,
            proxied,
        })
    }

    pub fn table_prefix(&self) -> &str {
        &self.config.etcd_table_prefix
    }

    /// Route a key to the direct or proxied KV strategy per the mode.
    fn kv_for(&self, key: &str) -> Arc<dyn KvStrategy> {
        match self.config.routing_mode() {
            RoutingMode::Direct => self.direct.as_ref().expect("direct set").kv.clone(),
            RoutingMode::ProxyFull => self.proxied.as_ref().expect("proxy set").kv.clone(),
            RoutingMode::ProxyWithExclusions => {
                if self.config.is_excluded_key(key) {
                    if let Some(direct) = &self.direct {
                        return direct.kv.clone();
                    }
                }
                self.proxied.as_ref().expect("proxy set").kv.clone()
            }
        }
    }

    fn lease_strategy(&self) -> Arc<dyn LeaseStrategy> {
        match &self.proxied {
            Some(set) => set.lease.clone(),
            None => self.direct.as_ref().expect("direct set").lease.clone(),
        }
    }

    fn election_strategy(&self) -> Arc<dyn ElectionStrategy> {
        // with passthrough disabled, election goes straight to the backend
        if let Some(set) = &self.proxied {
            if let Some(election) = &set.election {
                return election.clone();
            }
        }
        self.direct.as_ref().expect("direct set").election.clone()
    }

    /// The maintenance strategy monitors should probe.
    pub fn maintenance(&self) -> Arc<dyn MaintenanceStrategy> {
        match &self.proxied {
            Some(set) => set.maintenance.clone(),
            None => self.direct.as_ref().expect("direct set").maintenance.clone(),
        }
    }

    fn require_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidParameter("key must not be empty".into()));
        }
        Ok(())
    }

    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>> + Send,
        options: PutOptions,
    ) -> Result<PutResponse> {
        Self::require_key(key)?;
        self.kv_for(key).put(key, value.into(), options).await
    }

    pub async fn get(&self, key: &str, options: GetOptions) -> Result<GetResponse> {
        Self::require_key(key)?;
        self.kv_for(key).get(key, options).await
    }

    pub async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResponse> {
        Self::require_key(key)?;
        self.kv_for(key).delete(key, options).await
    }

    /// Start composing a transaction; commit it with
    /// [`MetastoreClient::commit`].
    pub fn transaction(&self) -> Txn {
        Txn::new()
    }

    pub async fn commit(&self, txn: &Txn) -> Result<TxnResponse> {
        let request = txn.build(&self.config.etcd_table_prefix)?;
        self.kv_for("")
            .commit_txn(request, txn.async_backup())
            .await
    }

    /// Commit a raw wire request; the caller keeps the raw response.
    pub async fn commit_raw(
        &self,
        request: rpc::TxnRequest,
        async_backup: bool,
    ) -> Result<rpc::TxnResponse> {
        self.kv_for("").commit_raw(request, async_backup).await
    }

    pub async fn watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        Self::require_key(key)?;
        self.kv_for(key).watch(key, options, observer, syncer).await
    }

    pub async fn get_and_watch(
        &self,
        key: &str,
        options: WatchOptions,
        observer: WatchObserver,
        syncer: Option<Syncer>,
    ) -> Result<Watcher> {
        Self::require_key(key)?;
        self.kv_for(key)
            .get_and_watch(key, options, observer, syncer)
            .await
    }

    pub async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
        self.lease_strategy().grant(ttl).await
    }

    pub async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse> {
        self.lease_strategy().revoke(lease_id).await
    }

    pub async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
        self.lease_strategy().keep_alive_once(lease_id).await
    }

    pub async fn campaign(
        &self,
        name: &str,
        lease_id: i64,
        proposal: impl Into<Vec<u8>> + Send,
    ) -> Result<CampaignResponse> {
        Self::require_key(name)?;
        self.election_strategy()
            .campaign(name, lease_id, proposal.into())
            .await
    }

    pub async fn leader(&self, name: &str) -> Result<LeaderResponse> {
        Self::require_key(name)?;
        self.election_strategy().leader(name).await
    }

    pub async fn resign(&self, leader: LeaderKey) -> Result<ResignResponse> {
        self.election_strategy().resign(leader).await
    }

    pub async fn observe(&self, name: &str, callback: ObserveCallback) -> Result<Observer> {
        Self::require_key(name)?;
        self.election_strategy().observe(name, callback).await
    }

    pub async fn health_check(&self) -> Result<StatusResponse> {
        self.maintenance().health_check().await
    }

    pub fn bind_reconnected_callback(&self, callback: ReconnectedCallback) {
        self.maintenance().bind_reconnected_callback(callback);
    }

    /// Every active strategy agrees the transport is usable.
    pub async fn is_connected(&self) -> bool {
        if let Some(set) = &self.proxied {
            if !set.kv.is_connected().await || !set.maintenance.is_connected().await {
                return false;
            }
        }
        if let Some(set) = &self.direct {
            if !set.channel.is_connected() {
                return false;
            }
        }
        true
    }

    /// The proxy peer moved; re-target every proxied strategy and kick off
    /// their re-watch / re-observe cycles.
    pub fn on_address_updated(&self, address: &str) {
        if let Some(set) = &self.proxied {
            set.kv.on_address_updated(address);
            set.lease.on_address_updated(address);
            if let Some(election) = &set.election {
                election.on_address_updated(address);
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(set) = &self.proxied {
            set.kv.shutdown().await;
            set.lease.shutdown().await;
            if let Some(election) = &set.election {
                election.shutdown().await;
            }
            set.maintenance.shutdown().await;
        }
        if let Some(set) = &self.direct {
            set.kv.shutdown().await;
            set.lease.shutdown().await;
            set.election.shutdown().await;
            set.maintenance.shutdown().await;
        }
        info!("metastore client shut down");
    }
}

impl HealthObserver for MetastoreClient {
    /// Fan the monitor's verdict out to every strategy gate in play.
    fn on_healthy_status(&self, status: HealthStatus) {
        if let Some(set) = &self.proxied {
            set.kv.on_healthy_status(status.clone());
            set.lease.on_healthy_status(status.clone());
            if let Some(election) = &set.election {
                election.on_healthy_status(status.clone());
            }
        }
        if let Some(set) = &self.direct {
            set.kv.on_healthy_status(status.clone());
            set.lease.on_healthy_status(status.clone());
            set.election.on_healthy_status(status);
        }
    }
}
