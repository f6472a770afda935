//! Raw-key elector: leadership is a create-if-absent transaction on the
//! election key, held by a lease and defended by a delete-triggered watch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use metastore_client::kv::Watcher;
use metastore_client::Result;
use metastore_core::{
    CmpOp, EventType, GetOptions, GetResponse, LeaseGrantResponse, LeaseKeepAliveResponse,
    PutOptions, SyncResult, Txn, TxnCmp, TxnOp, TxnResponse, WatchOptions,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{ElectionApi, ElectionParams, LeadershipCallback, NO_LEASE};

/// Elects and holds leadership of one raw election key.
pub struct TxnLeader {
    tx: mpsc::UnboundedSender<Msg>,
    has_leadership: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TxnLeader {
    /// Spawn the elector and run its initial probe: with no leader recorded
    /// it elects immediately, otherwise it stands by watching the key.
    pub fn start(
        election_key: &str,
        params: ElectionParams,
        client: Arc<dyn ElectionApi>,
        on_become_leader: Option<LeadershipCallback>,
        on_resign: Option<LeadershipCallback>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let has_leadership = Arc::new(AtomicBool::new(false));
        let actor = Actor {
            election_key: election_key.to_string(),
            params,
            client,
            tx: tx.clone(),
            lease_id: NO_LEASE,
            campaigning: false,
            has_leadership: has_leadership.clone(),
            watcher: None,
            on_become_leader,
            on_resign,
        };
        let task = tokio::spawn(actor.run(rx));
        let _ = tx.send(Msg::Start);
        Self {
            tx,
            has_leadership,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn has_leadership(&self) -> bool {
        self.has_leadership.load(Ordering::Acquire)
    }

    pub fn elect(&self) {
        let _ = self.tx.send(Msg::Elect);
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
    Start,
    InitDone(Result<GetResponse>),
    WatchReady(Watcher),
    Elect,
    GrantDone(Result<LeaseGrantResponse>),
    CampaignDone(Result<TxnResponse>),
    KeepAliveTick(i64),
    KeepAliveDone(i64, Result<LeaseKeepAliveResponse>),
    LeaderDeleted,
    RecheckDone(Result<GetResponse>),
    Shutdown(oneshot::Sender<()>),
}

struct Actor {
    election_key: String,
    params: ElectionParams,
    client: Arc<dyn ElectionApi>,
    tx: mpsc::UnboundedSender<Msg>,
    lease_id: i64,
    campaigning: bool,
    has_leadership: Arc<AtomicBool>,
    watcher: Option<Watcher>,
    on_become_leader: Option<LeadershipCallback>,
    on_resign: Option<LeadershipCallback>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Start => self.on_start(),
                Msg::InitDone(result) => self.on_init_done(result),
                Msg::WatchReady(watcher) => self.watcher = Some(watcher),
                Msg::Elect => self.on_elect(),
                Msg::GrantDone(result) => self.on_grant(result),
                Msg::CampaignDone(result) => self.on_campaign_done(result),
                Msg::KeepAliveTick(lease_id) => self.on_keep_alive_tick(lease_id),
                Msg::KeepAliveDone(lease_id, result) => self.on_keep_alive_done(lease_id, result),
                Msg::LeaderDeleted => {
                    info!(key = %self.election_key, "leader key deleted, entering election");
                    self.on_elect();
                }
                Msg::RecheckDone(result) => self.on_recheck_done(result),
                Msg::Shutdown(reply) => {
                    self.finalize().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn on_start(&mut self) {
        info!(key = %self.election_key, "election initialize");
        let client = self.client.clone();
        let key = self.election_key.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = client
                .get(
                    &key,
                    GetOptions {
                        keys_only: true,
                        ..Default::default()
                    },
                )
                .await;
            let _ = tx.send(Msg::InitDone(result));
        });
    }

    fn on_init_done(&mut self, result: Result<GetResponse>) {
        let watch_revision = match &result {
            Err(err) => {
                error!(key = %self.election_key, "failed to probe for a leader: {err}, delaying election");
                self.schedule_elect();
                0
            }
            Ok(response) if response.kvs.is_empty() => {
                info!(key = %self.election_key, "no leader recorded, electing now");
                let _ = self.tx.send(Msg::Elect);
                response.header.revision + 1
            }
            Ok(response) => response.header.revision + 1,
        };
        self.start_watch(watch_revision);
    }

    /// Watch the election key; any DELETE means the leader is gone.
    fn start_watch(&mut self, revision: i64) {
        let event_tx = self.tx.clone();
        let observer = Box::new(move |events: Vec<metastore_core::WatchEvent>, _synced: bool| {
            // multiple records may replay after a disconnect; the last wins
            if events
                .iter()
                .rev()
                .any(|event| event.event_type == EventType::Delete)
            {
                let _ = event_tx.send(Msg::LeaderDeleted);
            }
            true
        });

        let sync_client = self.client.clone();
        let sync_key = self.election_key.clone();
        let sync_tx = self.tx.clone();
        let syncer = Box::new(move || {
            let client = sync_client.clone();
            let key = sync_key.clone();
            let tx = sync_tx.clone();
            async move {
                info!(key = %key, "resyncing election key");
                match client.get(&key, GetOptions::default().with_prefix()).await {
                    Ok(response) => {
                        if response.kvs.is_empty() {
                            // the leader vanished inside the compacted window
                            let _ = tx.send(Msg::LeaderDeleted);
                        }
                        Some(SyncResult {
                            revision: response.header.revision,
                        })
                    }
                    Err(err) => {
                        error!(key = %key, "election key resync failed: {err}");
                        let _ = tx.send(Msg::LeaderDeleted);
                        None
                    }
                }
            }
            .boxed()
        });

        let client = self.client.clone();
        let key = self.election_key.clone();
        let tx = self.tx.clone();
        let options = WatchOptions::default()
            .starting_at(revision)
            .with_keep_retry();
        tokio::spawn(async move {
            match client.watch(&key, options, observer, Some(syncer)).await {
                Ok(watcher) => {
                    let _ = tx.send(Msg::WatchReady(watcher));
                }
                Err(err) => error!(key = %key, "failed to watch election key: {err}"),
            }
        });
    }

    fn on_elect(&mut self) {
        if self.campaigning {
            warn!(key = %self.election_key, "already electing");
            return;
        }
        info!(key = %self.election_key, "start elect");
        self.set_leadership(false);
        self.campaigning = true;
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
                self.lease_id = response.lease_id;
                let tick_tx = self.tx.clone();
                let interval = self.params.keep_alive_interval;
                let lease_id = response.lease_id;
                tokio::spawn(async move {
                    sleep(interval).await;
                    let _ = tick_tx.send(Msg::KeepAliveTick(lease_id));
                });

                let txn = Txn::new()
                    .when(TxnCmp::create_revision(self.election_key.as_str(), CmpOp::Equal, 0))
                    .and_then(TxnOp::put(
                        self.election_key.as_str(),
                        self.params.proposal.clone(),
                        PutOptions {
                            lease_id,
                            prev_kv: false,
                            async_backup: false,
                        },
                    ));
                let client = self.client.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(Msg::CampaignDone(client.commit(&txn).await));
                });
            }
            Err(err) => {
                error!(key = %self.election_key, "failed to grant election lease: {err}");
                self.campaigning = false;
                self.schedule_elect();
            }
        }
    }

    fn on_campaign_done(&mut self, result: Result<TxnResponse>) {
        self.campaigning = false;
        if matches!(&result, Ok(response) if response.success) {
            info!(key = %self.election_key, "campaign transaction won");
            self.set_leadership(true);
            return;
        }
        error!(key = %self.election_key, "campaign transaction lost");
        self.set_leadership(false);
        if self.lease_id != NO_LEASE {
            let client = self.client.clone();
            let lease_id = self.lease_id;
            tokio::spawn(async move {
                let _ = client.revoke(lease_id).await;
            });
            self.lease_id = NO_LEASE;
        }
        // make sure somebody leads, or run again
        let client = self.client.clone();
        let key = self.election_key.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = client
                .get(
                    &key,
                    GetOptions {
                        keys_only: true,
                        ..Default::default()
                    },
                )
                .await;
            let _ = tx.send(Msg::RecheckDone(result));
        });
    }

    fn on_recheck_done(&mut self, result: Result<GetResponse>) {
        match result {
            Err(err) => {
                error!(key = %self.election_key, "failed to re-check leader: {err}, delaying election");
                self.schedule_elect();
            }
            Ok(response) if response.kvs.is_empty() => {
                warn!(key = %self.election_key, "no leader elected after election, electing now");
                let _ = self.tx.send(Msg::Elect);
            }
            Ok(_) => {}
        }
    }

    fn on_keep_alive_tick(&mut self, lease_id: i64) {
        if self.lease_id != NO_LEASE && self.lease_id != lease_id {
            error!(
                key = %self.election_key,
                lease_id,
                current = self.lease_id,
                "stale lease, stopping its keep-alive loop"
            );
            return;
        }
        if !self.campaigning && !self.has_leadership.load(Ordering::Acquire) {
            warn!(key = %self.election_key, "not leader, stopping keep-alive");
            return;
        }
        let client = self.client.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = client.keep_alive_once(lease_id).await;
            let _ = tx.send(Msg::KeepAliveDone(lease_id, result));
        });
        let tick_tx = self.tx.clone();
        let interval = self.params.keep_alive_interval;
        tokio::spawn(async move {
            sleep(interval).await;
            let _ = tick_tx.send(Msg::KeepAliveTick(lease_id));
        });
    }

    fn on_keep_alive_done(&mut self, lease_id: i64, result: Result<LeaseKeepAliveResponse>) {
        if let Err(err) = result {
            error!(key = %self.election_key, lease_id, "keep alive failed: {err}, delaying election");
            self.schedule_elect();
        }
    }

    fn set_leadership(&mut self, leading: bool) {
        let was = self.has_leadership.swap(leading, Ordering::AcqRel);
        if was == leading {
            return;
        }
        if leading {
            if let Some(callback) = &self.on_become_leader {
                callback();
            }
        } else if let Some(callback) = &self.on_resign {
            callback();
        }
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
        info!(key = %self.election_key, "election finalize");
        self.set_leadership(false);
        self.campaigning = false;
        if let Some(watcher) = self.watcher.take() {
            watcher.cancel();
        }
        if self.lease_id != NO_LEASE {
            let _ = self.client.revoke(self.lease_id).await;
            self.lease_id = NO_LEASE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metastore_client::kv::{Syncer, WatchObserver};
    use metastore_core::{
        CampaignResponse, LeaderKey, LeaseRevokeResponse, ResignResponse, ResponseHeader,
    };
    use parking_lot::Mutex as PlMutex;

    /// A fake backend holding at most one leader record.
    #[derive(Default)]
    struct FakeStore {
        leader: PlMutex<Option<String>>,
        commits: PlMutex<u32>,
        revoked: PlMutex<Vec<i64>>,
        /// Simulate losing the create race: the commit fails and a rival
        /// appears as the recorded leader.
        lose_race: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ElectionApi for FakeStore {
        async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse> {
            Ok(LeaseGrantResponse {
                lease_id: 5,
                ttl,
                ..Default::default()
            })
        }

        async fn revoke(&self, lease_id: i64) -> Result<LeaseRevokeResponse> {
            self.revoked.lock().push(lease_id);
            Ok(LeaseRevokeResponse::default())
        }

        async fn keep_alive_once(&self, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
            Ok(LeaseKeepAliveResponse {
                lease_id,
                ttl: 10,
                ..Default::default()
            })
        }

        async fn campaign(
            &self,
            _name: &str,
            _lease_id: i64,
            _proposal: Vec<u8>,
        ) -> Result<CampaignResponse> {
            unreachable!("txn elector does not use the election API")
        }

        async fn resign(&self, _leader: LeaderKey) -> Result<ResignResponse> {
            Ok(ResignResponse::default())
        }

        async fn get(&self, key: &str, _options: GetOptions) -> Result<GetResponse> {
            let leader = self.leader.lock().clone();
            Ok(GetResponse {
                header: ResponseHeader {
                    revision: 3,
                    ..Default::default()
                },
                kvs: leader
                    .map(|value| {
                        vec![metastore_core::proto::mvcc::KeyValue {
                            key: key.as_bytes().to_vec(),
                            value: value.into_bytes(),
                            ..Default::default()
                        }]
                    })
                    .unwrap_or_default(),
                count: 0,
            })
        }

        async fn commit(&self, txn: &Txn) -> Result<TxnResponse> {
            *self.commits.lock() += 1;
            let mut leader = self.leader.lock();
            if self.lose_race.swap(false, Ordering::AcqRel) {
                *leader = Some("rival".into());
                return Ok(TxnResponse {
                    success: false,
                    ..Default::default()
                });
            }
            if leader.is_none() {
                *leader = Some("self".into());
                Ok(TxnResponse {
                    success: true,
                    ..Default::default()
                })
            } else {
                let _ = txn;
                Ok(TxnResponse {
                    success: false,
                    ..Default::default()
                })
            }
        }

        async fn watch(
            &self,
            _key: &str,
            _options: WatchOptions,
            _observer: WatchObserver,
            _syncer: Option<Syncer>,
        ) -> Result<Watcher> {
            Err(metastore_client::Error::Unavailable("no stream".into()))
        }
    }

    async fn drain() {
        for _ in 0..30 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn empty_key_elects_immediately_and_wins() {
        let store = Arc::new(FakeStore::default());
        let became: Arc<PlMutex<u32>> = Arc::new(PlMutex::new(0));
        let became_cb = became.clone();
        let leader = TxnLeader::start(
            "/master",
            ElectionParams::new("10.0.0.1:31501"),
            store.clone(),
            Some(Arc::new(move || *became_cb.lock() += 1)),
            None,
        );
        drain().await;

        assert!(leader.has_leadership());
        assert_eq!(*became.lock(), 1);
        assert_eq!(*store.commits.lock(), 1);

        leader.shutdown().await;
        assert_eq!(store.revoked.lock().clone(), vec![5]);
    }

    #[tokio::test]
    async fn existing_leader_means_standby() {
        let store = Arc::new(FakeStore::default());
        *store.leader.lock() = Some("other".into());
        let leader = TxnLeader::start(
            "/master",
            ElectionParams::new("10.0.0.1:31501"),
            store.clone(),
            None,
            None,
        );
        drain().await;

        assert!(!leader.has_leadership());
        assert_eq!(*store.commits.lock(), 0);

        // the recorded leader goes away: the elector takes over
        *store.leader.lock() = None;
        leader.elect();
        drain().await;
        assert!(leader.has_leadership());

        leader.shutdown().await;
    }

    #[tokio::test]
    async fn lost_campaign_with_surviving_leader_stands_by() {
        let store = Arc::new(FakeStore::default());
        store.lose_race.store(true, Ordering::Release);
        let leader = TxnLeader::start(
            "/master",
            ElectionParams::new("10.0.0.1:31501"),
            store.clone(),
            None,
            None,
        );
        drain().await;

        assert!(!leader.has_leadership());
        assert_eq!(*store.commits.lock(), 1);
        // the lease backing the lost campaign was revoked
        assert_eq!(store.revoked.lock().clone(), vec![5]);

        leader.shutdown().await;
    }
}
