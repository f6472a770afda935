//! End-to-end tests for the proxied strategies against a scripted peer
//! service living on an in-memory bus.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use metastore_client::bus::{BusAddress, BusMessage, MemoryBus, MessageBus};
use metastore_client::{Config, Error, HealthObserver, HealthStatus, MetastoreClient};
use metastore_core::proto::{mvcc, peer, rpc};
use metastore_core::{
    CmpOp, DeleteOptions, EventType, GetOptions, PutOptions, SortOrder, SortTarget, SyncResult,
    TxnCmp, TxnOp, TxnOpResponse, WatchEvent, WatchOptions,
};
use parking_lot::Mutex;
use prost::Message;
use tokio::sync::mpsc;

/// A miniature backend behind the peer envelope protocol: an ordered
/// key-value map with revisions, transactions, watches and leases.
struct FakePeer {
    bus: Arc<MemoryBus>,
    address: BusAddress,
    store: Mutex<BTreeMap<Vec<u8>, mvcc::KeyValue>>,
    revision: AtomicI64,
    next_watch_id: AtomicI64,
    next_lease_id: AtomicI64,
    watchers: Mutex<Vec<PeerWatcher>>,
    /// Leases marked expired answer keep-alives with ttl == 0.
    expired_leases: Mutex<Vec<i64>>,
    /// Reply to every unary request this many times (duplicate delivery).
    reply_times: AtomicU64,
}

struct PeerWatcher {
    watch_id: i64,
    key: Vec<u8>,
    range_end: Vec<u8>,
    client: BusAddress,
    cancelled: bool,
}

impl PeerWatcher {
    fn matches(&self, key: &[u8]) -> bool {
        if self.cancelled {
            return false;
        }
        if self.range_end.is_empty() {
            self.key == key
        } else {
            key >= self.key.as_slice() && key < self.range_end.as_slice()
        }
    }
}

impl FakePeer {
    fn start(bus: Arc<MemoryBus>) -> Arc<Self> {
        let peer = Arc::new(Self {
            address: BusAddress::new("KvServiceAccessorActor", "peer-1"),
            bus: bus.clone(),
            store: Mutex::new(BTreeMap::new()),
            revision: AtomicI64::new(0),
            next_watch_id: AtomicI64::new(0),
            next_lease_id: AtomicI64::new(100),
            watchers: Mutex::new(Vec::new()),
            expired_leases: Mutex::new(Vec::new()),
            reply_times: AtomicU64::new(1),
        });

        // one inbox serves both the kv and the lease accessor names
        for name in ["KvServiceAccessorActor", "LeaseServiceAccessorActor"] {
            let (tx, mut rx) = mpsc::unbounded_channel::<BusMessage>();
            bus.register(name, tx);
            let peer = peer.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    peer.handle(message);
                }
            });
        }
        peer
    }

    fn reply(&self, to: &BusAddress, method: &str, envelope: peer::MetaStoreResponse) {
        let payload: Bytes = envelope.encode_to_vec().into();
        let times = self.reply_times.load(Ordering::Acquire);
        for _ in 0..times {
            let _ = self.bus.send(&self.address, to, method, payload.clone());
        }
    }

    fn ok_reply(&self, request_id: &str, inner: impl Message) -> peer::MetaStoreResponse {
        peer::MetaStoreResponse {
            response_id: request_id.to_string(),
            status: 0,
            error_msg: String::new(),
            response_msg: inner.encode_to_vec(),
        }
    }

    fn header(&self) -> rpc::ResponseHeader {
        rpc::ResponseHeader {
            revision: self.revision.load(Ordering::Acquire),
            ..Default::default()
        }
    }

    fn handle(&self, message: BusMessage) {
        let envelope = peer::MetaStoreRequest::decode(message.payload.as_ref()).unwrap();
        let id = envelope.request_id.clone();
        match message.method.as_str() {
            "Put" => {
                let request = rpc::PutRequest::decode(envelope.request_msg.as_slice()).unwrap();
                let response = self.apply_put(&request);
                self.reply(&message.from, "OnPut", self.ok_reply(&id, response));
            }
            "Get" => {
                let request = rpc::RangeRequest::decode(envelope.request_msg.as_slice()).unwrap();
                let response = self.apply_range(&request);
                self.reply(&message.from, "OnGet", self.ok_reply(&id, response));
            }
            "Delete" => {
                let request =
                    rpc::DeleteRangeRequest::decode(envelope.request_msg.as_slice()).unwrap();
                let response = self.apply_delete(&request);
                self.reply(&message.from, "OnDelete", self.ok_reply(&id, response));
            }
            "Txn" => {
                let request = rpc::TxnRequest::decode(envelope.request_msg.as_slice()).unwrap();
                let response = self.apply_txn(&request);
                self.reply(&message.from, "OnTxn", self.ok_reply(&id, response));
            }
            "Watch" | "GetAndWatch" => {
                let request = rpc::WatchRequest::decode(envelope.request_msg.as_slice()).unwrap();
                match request.request_union {
                    Some(rpc::watch_request::RequestUnion::CreateRequest(create)) => {
                        let watch_id = self.next_watch_id.fetch_add(1, Ordering::AcqRel) + 1;
                        self.watchers.lock().push(PeerWatcher {
                            watch_id,
                            key: create.key.clone(),
                            range_end: create.range_end.clone(),
                            client: message.from.clone(),
                            cancelled: false,
                        });
                        let created = rpc::WatchResponse {
                            header: Some(self.header()),
                            watch_id,
                            created: true,
                            ..Default::default()
                        };
                        self.reply(&message.from, "OnWatch", self.ok_reply(&id, created));

                        if message.method == "GetAndWatch" {
                            // seed the new watcher with the current state
                            let range = self.apply_range(&rpc::RangeRequest {
                                key: create.key,
                                range_end: create.range_end,
                                ..Default::default()
                            });
                            let events = range
                                .kvs
                                .into_iter()
                                .map(|kv| mvcc::Event {
                                    r#type: mvcc::event::EventType::Put as i32,
                                    kv: Some(kv),
                                    prev_kv: None,
                                })
                                .collect();
                            let seeded = rpc::WatchResponse {
                                header: Some(self.header()),
                                watch_id,
                                events,
                                ..Default::default()
                            };
                            self.reply(&message.from, "OnWatch", self.ok_reply("", seeded));
                        }
                    }
                    Some(rpc::watch_request::RequestUnion::CancelRequest(_)) | None => {}
                }
            }
            "CancelWatch" => {
                let request = rpc::WatchRequest::decode(envelope.request_msg.as_slice()).unwrap();
                if let Some(rpc::watch_request::RequestUnion::CancelRequest(cancel)) =
                    request.request_union
                {
                    let mut watchers = self.watchers.lock();
                    if let Some(watcher) = watchers
                        .iter_mut()
                        .find(|watcher| watcher.watch_id == cancel.watch_id)
                    {
                        watcher.cancelled = true;
                        let ack = rpc::WatchResponse {
                            header: Some(self.header()),
                            watch_id: cancel.watch_id,
                            canceled: true,
                            ..Default::default()
                        };
                        self.reply(&watcher.client.clone(), "OnWatch", self.ok_reply("", ack));
                    }
                }
            }
            "Grant" => {
                let request =
                    rpc::LeaseGrantRequest::decode(envelope.request_msg.as_slice()).unwrap();
                let lease_id = self.next_lease_id.fetch_add(1, Ordering::AcqRel) + 1;
                let response = rpc::LeaseGrantResponse {
                    header: Some(self.header()),
                    id: lease_id,
                    ttl: request.ttl,
                    error: String::new(),
                };
                self.reply(&message.from, "OnGrant", self.ok_reply(&id, response));
            }
            "Revoke" => {
                let response = rpc::LeaseRevokeResponse {
                    header: Some(self.header()),
                };
                self.reply(&message.from, "OnRevoke", self.ok_reply(&id, response));
            }
            "KeepAliveOnce" => {
                let request =
                    rpc::LeaseKeepAliveRequest::decode(envelope.request_msg.as_slice()).unwrap();
                let expired = self.expired_leases.lock().contains(&request.id);
                let response = rpc::LeaseKeepAliveResponse {
                    header: Some(self.header()),
                    id: request.id,
                    ttl: if expired { 0 } else { 10 },
                };
                self.reply(&message.from, "OnKeepAliveOnce", self.ok_reply(&id, response));
            }
            other => panic!("fake peer got unexpected method {other}"),
        }
    }

    fn notify_watchers(&self, event: mvcc::Event) {
        let key = event.kv.as_ref().map(|kv| kv.key.clone()).unwrap_or_default();
        let header = self.header();
        for watcher in self.watchers.lock().iter() {
            if watcher.matches(&key) {
                let batch = rpc::WatchResponse {
                    header: Some(header.clone()),
                    watch_id: watcher.watch_id,
                    events: vec![event.clone()],
                    ..Default::default()
                };
                self.reply(&watcher.client, "OnWatch", self.ok_reply("", batch));
            }
        }
    }

    /// Cancel a watch from the server side, as after a compaction.
    fn cancel_server_side(&self, watch_id: i64, compact_revision: i64) {
        let client = {
            let mut watchers = self.watchers.lock();
            let watcher = watchers
                .iter_mut()
                .find(|watcher| watcher.watch_id == watch_id)
                .expect("watcher exists");
            watcher.cancelled = true;
            watcher.client.clone()
        };
        let cancel = rpc::WatchResponse {
            header: Some(self.header()),
            watch_id,
            canceled: true,
            compact_revision,
            cancel_reason: "compacted".into(),
            ..Default::default()
        };
        self.reply(&client, "OnWatch", self.ok_reply("", cancel));
    }

    fn apply_put(&self, request: &rpc::PutRequest) -> rpc::PutResponse {
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        let mut store = self.store.lock();
        let previous = store.get(&request.key).cloned();
        let kv = mvcc::KeyValue {
            key: request.key.clone(),
            value: request.value.clone(),
            create_revision: previous
                .as_ref()
                .map(|kv| kv.create_revision)
                .unwrap_or(revision),
            mod_revision: revision,
            version: previous.as_ref().map(|kv| kv.version).unwrap_or(0) + 1,
            lease: request.lease,
        };
        store.insert(request.key.clone(), kv.clone());
        drop(store);

        self.notify_watchers(mvcc::Event {
            r#type: mvcc::event::EventType::Put as i32,
            kv: Some(kv),
            prev_kv: previous.clone(),
        });

        rpc::PutResponse {
            header: Some(rpc::ResponseHeader {
                revision,
                ..Default::default()
            }),
            prev_kv: if request.prev_kv { previous } else { None },
        }
    }

    fn apply_delete(&self, request: &rpc::DeleteRangeRequest) -> rpc::DeleteRangeResponse {
        let revision = self.revision.fetch_add(1, Ordering::AcqRel) + 1;
        let mut store = self.store.lock();
        let keys: Vec<Vec<u8>> = store
            .keys()
            .filter(|key| {
                if request.range_end.is_empty() {
                    key.as_slice() == request.key.as_slice()
                } else {
                    key.as_slice() >= request.key.as_slice()
                        && key.as_slice() < request.range_end.as_slice()
                }
            })
            .cloned()
            .collect();
        let mut prev_kvs = Vec::new();
        for key in &keys {
            if let Some(kv) = store.remove(key) {
                prev_kvs.push(kv);
            }
        }
        drop(store);

        for kv in &prev_kvs {
            self.notify_watchers(mvcc::Event {
                r#type: mvcc::event::EventType::Delete as i32,
                kv: Some(mvcc::KeyValue {
                    key: kv.key.clone(),
                    mod_revision: revision,
                    ..Default::default()
                }),
                prev_kv: Some(kv.clone()),
            });
        }

        rpc::DeleteRangeResponse {
            header: Some(rpc::ResponseHeader {
                revision,
                ..Default::default()
            }),
            deleted: prev_kvs.len() as i64,
            prev_kvs: if request.prev_kv { prev_kvs } else { Vec::new() },
        }
    }

    fn apply_range(&self, request: &rpc::RangeRequest) -> rpc::RangeResponse {
        let store = self.store.lock();
        let mut kvs: Vec<mvcc::KeyValue> = store
            .values()
            .filter(|kv| {
                if request.range_end.is_empty() {
                    kv.key == request.key
                } else {
                    kv.key.as_slice() >= request.key.as_slice()
                        && kv.key.as_slice() < request.range_end.as_slice()
                }
            })
            .cloned()
            .collect();
        let count = kvs.len() as i64;
        if request.sort_order == rpc::range_request::SortOrder::Descend as i32 {
            kvs.reverse();
        }
        if request.limit > 0 {
            kvs.truncate(request.limit as usize);
        }
        if request.count_only {
            kvs.clear();
        }
        rpc::RangeResponse {
            header: Some(self.header()),
            kvs,
            more: false,
            count,
        }
    }

    fn apply_txn(&self, request: &rpc::TxnRequest) -> rpc::TxnResponse {
        let success = request.compare.iter().all(|compare| self.evaluate(compare));
        let ops = if success {
            &request.success
        } else {
            &request.failure
        };
        let responses = ops
            .iter()
            .map(|op| {
                let response = match op.request.as_ref().expect("op set") {
                    rpc::request_op::Request::RequestPut(put) => {
                        rpc::response_op::Response::ResponsePut(self.apply_put(put))
                    }
                    rpc::request_op::Request::RequestDeleteRange(delete) => {
                        rpc::response_op::Response::ResponseDeleteRange(self.apply_delete(delete))
                    }
                    rpc::request_op::Request::RequestRange(range) => {
                        rpc::response_op::Response::ResponseRange(self.apply_range(range))
                    }
                };
                rpc::ResponseOp {
                    response: Some(response),
                }
            })
            .collect();
        rpc::TxnResponse {
            header: Some(self.header()),
            succeeded: success,
            responses,
        }
    }

    fn evaluate(&self, compare: &rpc::Compare) -> bool {
        let store = self.store.lock();
        let kv = store.get(&compare.key);
        match compare.target_union.as_ref().expect("target set") {
            rpc::compare::TargetUnion::Version(expected) => {
                let actual = kv.map(|kv| kv.version).unwrap_or(0);
                compare_i64(compare.result, actual, *expected)
            }
            rpc::compare::TargetUnion::CreateRevision(expected) => {
                let actual = kv.map(|kv| kv.create_revision).unwrap_or(0);
                compare_i64(compare.result, actual, *expected)
            }
            rpc::compare::TargetUnion::ModRevision(expected) => {
                let actual = kv.map(|kv| kv.mod_revision).unwrap_or(0);
                compare_i64(compare.result, actual, *expected)
            }
            rpc::compare::TargetUnion::Value(expected) => {
                let actual = kv.map(|kv| kv.value.clone()).unwrap_or_default();
                match rpc::compare::CompareResult::try_from(compare.result).unwrap() {
                    rpc::compare::CompareResult::Equal => &actual == expected,
                    rpc::compare::CompareResult::NotEqual => &actual != expected,
                    rpc::compare::CompareResult::Greater => &actual > expected,
                    rpc::compare::CompareResult::Less => &actual < expected,
                }
            }
            rpc::compare::TargetUnion::Lease(expected) => {
                let actual = kv.map(|kv| kv.lease).unwrap_or(0);
                compare_i64(compare.result, actual, *expected)
            }
        }
    }
}

fn compare_i64(result: i32, actual: i64, expected: i64) -> bool {
    match rpc::compare::CompareResult::try_from(result).unwrap() {
        rpc::compare::CompareResult::Equal => actual == expected,
        rpc::compare::CompareResult::Greater => actual > expected,
        rpc::compare::CompareResult::Less => actual < expected,
        rpc::compare::CompareResult::NotEqual => actual != expected,
    }
}

async fn proxy_client(prefix: &str) -> (Arc<MetastoreClient>, Arc<FakePeer>, Arc<MemoryBus>) {
    let bus = MemoryBus::new();
    let peer = FakePeer::start(bus.clone());
    let config = Config::proxied("peer-1").with_table_prefix(prefix);
    let client = MetastoreClient::new(config, Some(bus.clone() as Arc<dyn MessageBus>))
        .await
        .unwrap();
    (Arc::new(client), peer, bus)
}

async fn drain() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn put_get_roundtrip() {
    let (client, _peer, _bus) = proxy_client("").await;

    let first = client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();
    assert!(first.prev_kv.is_none());

    let second = client
        .put("/sn/workers/xxx", "3.0", PutOptions::default().with_prev_kv())
        .await
        .unwrap();
    let prev = second.prev_kv.unwrap();
    assert_eq!(prev.key, b"/sn/workers/xxx");
    assert_eq!(prev.value, b"1.0");

    let stored = client
        .get("/sn/workers/xxx", GetOptions::default())
        .await
        .unwrap();
    assert_eq!(stored.kvs.len(), 1);
    assert_eq!(stored.kvs[0].value, b"3.0");

    client.shutdown().await;
}

#[tokio::test]
async fn delete_by_prefix_returns_prev_kvs() {
    let (client, _peer, _bus) = proxy_client("").await;
    for name in ["xxx", "yyy", "zzz"] {
        client
            .put(&format!("/sn/workers/{name}"), "1.0", PutOptions::default())
            .await
            .unwrap();
    }

    let deleted = client
        .delete(
            "/sn/workers/",
            DeleteOptions::default().with_prefix().with_prev_kv(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.deleted, 3);
    assert_eq!(deleted.prev_kvs.len(), 3);

    let remaining = client
        .get("/sn/workers/", GetOptions::default().with_prefix())
        .await
        .unwrap();
    assert!(remaining.kvs.is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn transaction_takes_the_matching_branch() {
    let (client, _peer, _bus) = proxy_client("").await;
    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();
    client
        .put("/sn/workers/yyy", "1.0", PutOptions::default())
        .await
        .unwrap();

    let txn = client
        .transaction()
        .when(TxnCmp::value("/sn/workers/xxx", CmpOp::Equal, "1.0"))
        .and_then(TxnOp::delete(
            "/sn/workers/xxx",
            DeleteOptions::default().with_prev_kv(),
        ))
        .and_then(TxnOp::put(
            "/sn/workers/yyy",
            "2.0",
            PutOptions::default().with_prev_kv(),
        ))
        .and_then(TxnOp::get(
            "/sn/workers/",
            GetOptions::default()
                .with_prefix()
                .with_sort(SortTarget::Key, SortOrder::Descend),
        ));
    let response = client.commit(&txn).await.unwrap();

    assert!(response.success);
    assert_eq!(response.responses.len(), 3);
    match &response.responses[0] {
        TxnOpResponse::Delete(delete) => {
            assert_eq!(delete.deleted, 1);
            assert_eq!(delete.prev_kvs[0].value, b"1.0");
        }
        other => panic!("expected delete, got {other:?}"),
    }
    match &response.responses[1] {
        TxnOpResponse::Put(put) => {
            assert_eq!(put.prev_kv.as_ref().unwrap().value, b"1.0");
        }
        other => panic!("expected put, got {other:?}"),
    }
    match &response.responses[2] {
        TxnOpResponse::Get(get) => {
            assert_eq!(get.kvs.len(), 1);
            assert_eq!(get.kvs[0].key, b"/sn/workers/yyy");
        }
        other => panic!("expected get, got {other:?}"),
    }

    client.shutdown().await;
}

#[tokio::test]
async fn table_prefix_is_transparent() {
    let (client, peer, _bus) = proxy_client("/cluster-a").await;
    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();

    // the wire key carries the prefix
    assert!(peer
        .store
        .lock()
        .contains_key(b"/cluster-a/sn/workers/xxx".as_slice()));

    // returned keys do not
    let stored = client
        .get("/sn/workers/", GetOptions::default().with_prefix())
        .await
        .unwrap();
    assert_eq!(stored.kvs[0].key, b"/sn/workers/xxx");

    client.shutdown().await;
}

#[tokio::test]
async fn watch_delivers_translated_events() {
    let (client, _peer, _bus) = proxy_client("").await;
    let events: Arc<Mutex<Vec<(EventType, Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let watcher = client
        .watch(
            "/sn/workers/",
            WatchOptions::default().with_prefix(),
            Box::new(move |batch: Vec<WatchEvent>, synced| {
                for event in batch {
                    sink.lock()
                        .push((event.event_type, event.kv.key.clone(), synced));
                }
                true
            }),
            None,
        )
        .await
        .unwrap();
    drain().await;
    assert!(watcher.watch_id() > 0);

    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();
    client
        .delete("/sn/workers/xxx", DeleteOptions::default())
        .await
        .unwrap();
    drain().await;

    let seen = events.lock().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (EventType::Put, b"/sn/workers/xxx".to_vec(), false));
    assert_eq!(
        seen[1],
        (EventType::Delete, b"/sn/workers/xxx".to_vec(), false)
    );

    client.shutdown().await;
}

#[tokio::test]
async fn get_and_watch_seeds_one_synced_batch_first() {
    let (client, _peer, _bus) = proxy_client("").await;
    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();

    let batches: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    let _watcher = client
        .get_and_watch(
            "/sn/workers/",
            WatchOptions::default().with_prefix(),
            Box::new(move |batch: Vec<WatchEvent>, synced| {
                sink.lock().push((batch.len(), synced));
                true
            }),
            None,
        )
        .await
        .unwrap();
    drain().await;

    client
        .put("/sn/workers/yyy", "2.0", PutOptions::default())
        .await
        .unwrap();
    drain().await;

    let seen = batches.lock().clone();
    assert!(seen.len() >= 2);
    // seeded state first, marked synced; live traffic after, not synced
    assert_eq!(seen[0], (1, true));
    assert_eq!(seen[1], (1, false));

    client.shutdown().await;
}

#[tokio::test]
async fn compaction_cancel_syncs_once_and_rewatches() {
    let (client, peer, _bus) = proxy_client("").await;
    let sync_count = Arc::new(AtomicU64::new(0));
    let sync_counter = sync_count.clone();
    let events: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();

    let watcher = client
        .watch(
            "/sn/workers/",
            WatchOptions::default().with_prefix(),
            Box::new(move |batch: Vec<WatchEvent>, _synced| {
                for event in batch {
                    sink.lock().push(event.kv.key.clone());
                }
                true
            }),
            Some(Box::new(move || {
                let sync_counter = sync_counter.clone();
                async move {
                    sync_counter.fetch_add(1, Ordering::AcqRel);
                    Some(SyncResult { revision: 50 })
                }
                .boxed()
            })),
        )
        .await
        .unwrap();
    drain().await;
    let first_id = watcher.watch_id();
    assert!(first_id > 0);

    peer.cancel_server_side(first_id, 40);
    drain().await;

    // the syncer ran exactly once and the watch was re-created
    assert_eq!(sync_count.load(Ordering::Acquire), 1);
    let second_id = watcher.watch_id();
    assert!(second_id > first_id);

    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();
    drain().await;
    assert_eq!(events.lock().clone(), vec![b"/sn/workers/xxx".to_vec()]);

    client.shutdown().await;
}

#[tokio::test]
async fn watcher_close_is_idempotent_and_final() {
    let (client, _peer, _bus) = proxy_client("").await;
    let observed = Arc::new(AtomicU64::new(0));
    let counter = observed.clone();
    let watcher = client
        .watch(
            "/sn/workers/",
            WatchOptions::default().with_prefix(),
            Box::new(move |_batch, _synced| {
                counter.fetch_add(1, Ordering::AcqRel);
                true
            }),
            None,
        )
        .await
        .unwrap();
    drain().await;

    watcher.cancel();
    watcher.cancel();
    drain().await;

    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();
    drain().await;
    assert_eq!(observed.load(Ordering::Acquire), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn fallbreak_fails_fast_until_recovery() {
    let (client, _peer, _bus) = proxy_client("").await;

    client.on_healthy_status(HealthStatus::Unhealthy("5 straight probe failures".into()));
    let err = client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FallBreak(_)));

    client.on_healthy_status(HealthStatus::Ok);
    client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();

    client.shutdown().await;
}

#[tokio::test]
async fn duplicate_replies_complete_the_request_once() {
    let (client, peer, _bus) = proxy_client("").await;
    peer.reply_times.store(2, Ordering::Release);

    // the duplicate reply is dropped by the tracker, not surfaced
    let response = client
        .put("/sn/workers/xxx", "1.0", PutOptions::default())
        .await
        .unwrap();
    assert!(response.header.revision > 0);
    drain().await;

    client.shutdown().await;
}

#[tokio::test]
async fn lease_surface_works_through_the_peer() {
    let (client, peer, _bus) = proxy_client("").await;

    let granted = client.grant(3).await.unwrap();
    assert!(granted.lease_id > 100);
    assert_eq!(granted.ttl, 3);

    let alive = client.keep_alive_once(granted.lease_id).await.unwrap();
    assert_eq!(alive.lease_id, granted.lease_id);
    assert!(alive.ttl > 0);

    // an expired lease surfaces as a dedicated error
    peer.expired_leases.lock().push(granted.lease_id);
    let err = client.keep_alive_once(granted.lease_id).await.unwrap_err();
    assert!(matches!(err, Error::LeaseExpired(_)));

    client.revoke(granted.lease_id).await.unwrap();
    client.shutdown().await;
}
