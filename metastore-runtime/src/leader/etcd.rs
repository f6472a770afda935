//! Election-API elector: grant a lease, keep it alive, campaign, and
//! confirm leadership through the explorer's observation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metastore_core::{CampaignResponse, LeaderKey, LeaseGrantResponse, LeaseKeepAliveResponse};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{ElectionApi, ElectionParams, LeadershipCallback, NO_LEASE};
use crate::explorer::{ExplorerHandle, LeaderInfo};
use metastore_client::Result;

/// Elects and holds leadership of one election key.
pub struct EtcdLeader {
    tx: mpsc::UnboundedSender<Msg>,
    has_leadership: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdLeader {
    /// Spawn the elector actor; call [`EtcdLeader::elect`] to enter the
    /// election. Leadership changes observed by `explorer` drive the
    /// become/resign callbacks.
    pub fn start(
        election_key: &str,
        params: ElectionParams,
        client: Arc<dyn ElectionApi>,
        explorer: ExplorerHandle,
        on_become_leader: Option<LeadershipCallback>,
        on_resign: Option<LeadershipCallback>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let has_leadership = Arc::new(AtomicBool::new(false));

        let callback_id = format!("{election_key}-leaderactor");
        let change_tx = tx.clone();
        explorer.add_callback(
            callback_id.clone(),
            Arc::new(move |info: &LeaderInfo| {
                let _ = change_tx.send(Msg::LeaderChanged(info.clone()));
            }),
        );

        let actor = Actor {
            election_key: election_key.to_string(),
            params,
            client,
            explorer,
            callback_id,
            tx: tx.clone(),
            current_lease: NO_LEASE,
            campaigning: false,
            elect_after_campaign: false,
            leader_key: None,
            cached_leader: None,
            has_leadership: has_leadership.clone(),
            on_become_leader,
            on_resign,
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            tx,
            has_leadership,
            task: Mutex::new(Some(task)),
        }
    }

    /// Enter (or re-enter) the election.
    pub fn elect(&self) {
        let _ = self.tx.send(Msg::Elect);
    }

    pub fn has_leadership(&self) -> bool {
        self.has_leadership.load(Ordering::Acquire)
    }

    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
    }
}

enum Msg {
    Elect,
    GrantDone(Result<LeaseGrantResponse>),
    KeepAliveTick(i64),
    KeepAliveDone(i64, Result<LeaseKeepAliveResponse>),
    CampaignDone(i64, Result<CampaignResponse>),
    LeaderChanged(LeaderInfo),
    Shutdown(oneshot::Sender<()>),
}

struct Actor {
    election_key: String,
    params: ElectionParams,
    client: Arc<dyn ElectionApi>,
    explorer: ExplorerHandle,
    callback_id: String,
    tx: mpsc::UnboundedSender<Msg>,
    current_lease: i64,
    campaigning: bool,
    /// A keep-alive failure arrived while the campaign was in flight; run
    /// the next election once the campaign settles.
    elect_after_campaign: bool,
    leader_key: Option<LeaderKey>,
    cached_leader: Option<LeaderInfo>,
    has_leadership: Arc<AtomicBool>,
    on_become_leader: Option<LeadershipCallback>,
    on_resign: Option<LeadershipCallback>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Elect => self.on_elect(),
                Msg::GrantDone(result) => self.on_grant(result),
                Msg::KeepAliveTick(lease_id) => self.on_keep_alive_tick(lease_id),
                Msg::KeepAliveDone(lease_id, result) => self.on_keep_alive_done(lease_id, result),
                Msg::CampaignDone(lease_id, result) => self.on_campaign_done(lease_id, result),
                Msg::LeaderChanged(info) => self.on_leader_changed(info),
                Msg::Shutdown(reply) => {
                    self.finalize().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn on_elect(&mut self) {
        if self.campaigning {
            warn!(key = %self.election_key, "an election is already in progress");
            return;
        }
        info!(key = %self.election_key, "entering election");
        self.campaigning = true;
        self.current_lease = NO_LEASE;
        let client = self.client.clone();
        let ttl = self.params.lease_ttl;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Msg::GrantDone(client.grant(ttl).await));
        });
    }

    fn on_grant(&mut self, result: Result<LeaseGrantResponse>) {
        match result {
            Ok(response) => {
                info!(key = %self.election_key, lease_id = response.lease_id, "lease granted");
                self.current_lease = response.lease_id;
                // start renewing immediately, then campaign under the lease
                let _ = self.tx.send(Msg::KeepAliveTick(response.lease_id));
                let client = self.client.clone();
                let key = self.election_key.clone();
                let proposal = self.params.proposal.clone().into_bytes();
                let lease_id = response.lease_id;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.campaign(&key, lease_id, proposal).await;
                    let _ = tx.send(Msg::CampaignDone(lease_id, result));
                });
            }
            Err(err) => {
                error!(key = %self.election_key, "failed to grant election lease: {err}");
                self.campaigning = false;
                self.schedule_elect();
            }
        }
    }

    fn on_keep_alive_tick(&mut self, lease_id: i64) {
        if lease_id != self.current_lease {
            warn!(
                key = %self.election_key,
                lease_id,
                current = self.current_lease,
                "stale lease, stopping its keep-alive loop"
            );
            return;
        }
        let client = self.client.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = client.keep_alive_once(lease_id).await;
            let _ = tx.send(Msg::KeepAliveDone(lease_id, result));
        });
    }

    fn on_keep_alive_done(&mut self, lease_id: i64, result: Result<LeaseKeepAliveResponse>) {
        if lease_id != self.current_lease {
            return;
        }
        match result {
            Ok(_) => {
                let tx = self.tx.clone();
                let interval = self.params.keep_alive_interval;
                tokio::spawn(async move {
                    sleep(interval).await;
                    let _ = tx.send(Msg::KeepAliveTick(lease_id));
                });
            }
            Err(err) => {
                error!(key = %self.election_key, lease_id, "failed to keep election lease alive: {err}");
                self.current_lease = NO_LEASE;
                if self.campaigning {
                    self.elect_after_campaign = true;
                } else {
                    let _ = self.tx.send(Msg::Elect);
                }
            }
        }
    }

    fn on_campaign_done(&mut self, lease_id: i64, result: Result<CampaignResponse>) {
        self.campaigning = false;
        if self.elect_after_campaign {
            self.elect_after_campaign = false;
            let _ = self.tx.send(Msg::Elect);
            return;
        }
        match result {
            Err(err) => {
                error!(key = %self.election_key, "campaign failed: {err}, re-entering election");
                let _ = self.tx.send(Msg::Elect);
            }
            Ok(_) if self.current_lease == NO_LEASE || self.current_lease != lease_id => {
                error!(key = %self.election_key, "lease expired during campaign, already re-electing");
            }
            Ok(response) => {
                info!(
                    key = %self.election_key,
                    leader_key = %response.leader.key,
                    lease_id = response.leader.lease,
                    "campaign won, waiting for the observation to confirm"
                );
                self.leader_key = Some(response.leader.clone());
                // the observer may lag; publish the win locally right away
                self.explorer.fast_publish(LeaderInfo {
                    name: response.leader.name,
                    address: self.params.proposal.clone(),
                    revision: response.header.revision,
                });
            }
        }
    }

    fn on_leader_changed(&mut self, info: LeaderInfo) {
        let was_leader = self
            .cached_leader
            .as_ref()
            .is_some_and(|cached| cached.address == self.params.proposal);
        if info.address == self.params.proposal {
            info!(key = %self.election_key, "leader observation confirms this process");
            if !was_leader {
                self.has_leadership.store(true, Ordering::Release);
                if let Some(callback) = &self.on_become_leader {
                    callback();
                }
            }
        } else if was_leader {
            info!(key = %self.election_key, leader = %info.address, "leadership lost");
            self.has_leadership.store(false, Ordering::Release);
            if let Some(callback) = &self.on_resign {
                callback();
            }
        } else if !self.campaigning {
            // we are idle and somebody else leads; contend again
            info!(key = %self.election_key, leader = %info.address, "not electing and not leader, re-entering");
            let _ = self.tx.send(Msg::Elect);
        }
        self.cached_leader = Some(info);
    }

    fn schedule_elect(&self) {
        let tx = self.tx.clone();
        let delay = self.params.keep_alive_interval;
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Msg::Elect);
        });
    }

    async fn finalize(&mut self) {
        self.explorer.remove_callback(&self.callback_id);
        self.has_leadership.store(false, Ordering::Release);
        if let Some(leader_key) = self.leader_key.take() {
            debug!(key = %self.election_key, "resigning leadership on shutdown");
            if let Err(err) = self.client.resign(leader_key).await {
                warn!(key = %self.election_key, "failed to resign: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::StandaloneExplorer;
    use async_trait::async_trait;
    use metastore_client::kv::{Syncer, WatchObserver, Watcher};
    use metastore_client::Error;
    use metastore_core::{
        GetOptions, GetResponse, LeaseRevokeResponse, ResignResponse, ResponseHeader, Txn,
        TxnResponse, WatchOptions,
    };
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct FakeApi {
        grants: PlMutex<Vec<i64>>,
        campaigns: PlMutex<Vec<(String, i64)>>,
        keep_alives: PlMutex<Vec<i64>>,
        fail_campaign_once: AtomicBool,
    }

    #[async_trait]
    impl ElectionApi for FakeApi {
        async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
            self.grants.lock().push(ttl);
            Ok(LeaseGrantResponse {
                lease_id: 77,
                ttl,
                ..Default::default()
            })
        }

        async fn revoke(&self, _lease_id: i64) -> Result<LeaseRevokeResponse> {
            Ok(LeaseRevokeResponse::default())
        }

        async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
            self.keep_alives.lock().push(lease_id);
            Ok(LeaseKeepAliveResponse {
                lease_id,
                ttl: 10,
                ..Default::default()
            })
        }

        async fn campaign(
            &self,
            name: &str,
            lease_id: i64,
            _proposal: Vec<u8>,
        ) -> Result<CampaignResponse> {
            self.campaigns.lock().push((name.to_string(), lease_id));
            if self.fail_campaign_once.swap(false, Ordering::AcqRel) {
                return Err(Error::Unavailable("campaign interrupted".into()));
            }
            Ok(CampaignResponse {
                header: ResponseHeader {
                    revision: 42,
                    ..Default::default()
                },
                leader: LeaderKey {
                    name: name.to_string(),
                    key: format!("{name}/4d"),
                    rev: 42,
                    lease: lease_id,
                },
            })
        }

        async fn resign(&self, _leader: LeaderKey) -> Result<ResignResponse> {
            Ok(ResignResponse::default())
        }

        async fn get(&self, _key: &str, _options: GetOptions) -> Result<GetResponse> {
            Ok(GetResponse::default())
        }

        async fn commit(&self, _txn: &Txn) -> Result<TxnResponse> {
            Ok(TxnResponse::default())
        }

        async fn watch(
            &self,
            _key: &str,
            _options: WatchOptions,
            _observer: WatchObserver,
            _syncer: Option<Syncer>,
        ) -> Result<Watcher> {
            Err(Error::Unavailable("not used".into()))
        }
    }

    async fn drain() {
        for _ in 0..30 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn winning_campaign_publishes_and_confirms_leadership() {
        let api = Arc::new(FakeApi::default());
        let explorer = StandaloneExplorer::start(
            "/master",
            LeaderInfo {
                name: "/master".into(),
                address: String::new(),
                revision: 0,
            },
        );
        let became: Arc<PlMutex<u32>> = Arc::new(PlMutex::new(0));
        let became_cb = became.clone();
        let leader = EtcdLeader::start(
            "/master",
            ElectionParams::new("10.0.0.1:31501"),
            api.clone(),
            explorer.clone(),
            Some(Arc::new(move || *became_cb.lock() += 1)),
            None,
        );

        leader.elect();
        drain().await;

        assert_eq!(api.grants.lock().clone(), vec![10]);
        assert_eq!(api.campaigns.lock().clone(), vec![("/master".to_string(), 77)]);
        // the fast-path publication reached the explorer and flowed back
        assert_eq!(
            explorer.cached_leader().map(|info| info.address),
            Some("10.0.0.1:31501".to_string())
        );
        assert!(leader.has_leadership());
        assert_eq!(*became.lock(), 1);

        // a repeated observation of the same leader does not re-fire
        explorer.fast_publish(LeaderInfo {
            name: "/master".into(),
            address: "10.0.0.1:31501".into(),
            revision: 43,
        });
        drain().await;
        assert_eq!(*became.lock(), 1);

        leader.shutdown().await;
        explorer.shutdown().await;
    }

    #[tokio::test]
    async fn failed_campaign_re_enters_election() {
        let api = Arc::new(FakeApi::default());
        api.fail_campaign_once.store(true, Ordering::Release);
        let explorer = StandaloneExplorer::start(
            "/master",
            LeaderInfo {
                name: "/master".into(),
                address: String::new(),
                revision: 0,
            },
        );
        let leader = EtcdLeader::start(
            "/master",
            ElectionParams::new("10.0.0.1:31501"),
            api.clone(),
            explorer.clone(),
            None,
            None,
        );

        leader.elect();
        drain().await;

        // first campaign failed, the second (after re-elect) succeeded
        assert!(api.campaigns.lock().len() >= 2);
        assert!(leader.has_leadership());

        leader.shutdown().await;
        explorer.shutdown().await;
    }
}
