//! Bookkeeping for watch records: registration order for re-watching, the
//! FIFO of records awaiting their created-ack, and the ready map keyed by
//! server watch id.

use std::collections::{HashMap, VecDeque};

use super::WatchRecord;

pub(crate) type RecordId = u64;

#[derive(Default)]
pub(crate) struct WatchSet {
    records: HashMap<RecordId, WatchRecord>,
    /// Registration order, for deterministic re-watch after reconnect.
    order: Vec<RecordId>,
    /// Records awaiting the server's created acknowledgement, in write order.
    pending: VecDeque<RecordId>,
    /// Proxy flavor: created replies are matched by uuid instead of order.
    pending_by_uuid: HashMap<String, RecordId>,
    ready: HashMap<i64, RecordId>,
    next_id: RecordId,
}

impl WatchSet {
    pub fn insert(&mut self, record: WatchRecord) -> RecordId {
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(id, record);
        self.order.push(id);
        id
    }

    pub fn get(&self, id: RecordId) -> Option<&WatchRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut WatchRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.records.contains_key(&id)
    }

    /// Drop every record whose watcher has been cancelled. Stale ids may
    /// linger in `pending`/`ready`; lookups treat them as cancelled.
    pub fn prune_cancelled(&mut self) {
        self.records.retain(|_, record| !record.watcher.is_cancelled());
        let records = &self.records;
        self.order.retain(|id| records.contains_key(id));
        self.pending_by_uuid.retain(|_, id| records.contains_key(id));
    }

    pub fn push_pending(&mut self, id: RecordId) {
        self.pending.push_back(id);
    }

    pub fn pop_pending(&mut self) -> Option<RecordId> {
        self.pending.pop_front()
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.pending_by_uuid.clear();
    }

    pub fn set_pending_uuid(&mut self, uuid: String, id: RecordId) {
        self.pending_by_uuid.insert(uuid, id);
    }

    pub fn take_pending_uuid(&mut self, uuid: &str) -> Option<RecordId> {
        self.pending_by_uuid.remove(uuid)
    }

    pub fn bind_ready(&mut self, watch_id: i64, id: RecordId) {
        self.ready.insert(watch_id, id);
    }

    pub fn ready_record(&self, watch_id: i64) -> Option<RecordId> {
        self.ready.get(&watch_id).copied()
    }

    pub fn unbind_ready(&mut self, watch_id: i64) -> Option<RecordId> {
        self.ready.remove(&watch_id)
    }

    pub fn ready_watch_ids(&self) -> Vec<i64> {
        self.ready.keys().copied().collect()
    }

    pub fn clear_ready(&mut self) {
        self.ready.clear();
    }

    /// Ids of all live (non-cancelled) records in registration order.
    pub fn active_ids(&self) -> Vec<RecordId> {
        self.order
            .iter()
            .copied()
            .filter(|id| {
                self.records
                    .get(id)
                    .is_some_and(|record| !record.watcher.is_cancelled())
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
        self.pending.clear();
        self.pending_by_uuid.clear();
        self.ready.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Watcher;
    use metastore_core::WatchOptions;

    fn record(key: &str) -> WatchRecord {
        WatchRecord {
            key: key.into(),
            options: WatchOptions::default(),
            observer: Box::new(|_, _| true),
            syncer: None,
            watcher: Watcher::new(|_| {}),
            uuid: String::new(),
        }
    }

    #[test]
    fn pending_is_fifo() {
        let mut set = WatchSet::default();
        let a = set.insert(record("/a"));
        let b = set.insert(record("/b"));
        set.push_pending(a);
        set.push_pending(b);
        assert_eq!(set.pop_pending(), Some(a));
        assert_eq!(set.pop_pending(), Some(b));
        assert_eq!(set.pop_pending(), None);
    }

    #[test]
    fn prune_drops_cancelled_records_and_keeps_order() {
        let mut set = WatchSet::default();
        let a = set.insert(record("/a"));
        let b = set.insert(record("/b"));
        let c = set.insert(record("/c"));
        set.get(b).unwrap().watcher.cancel();
        set.prune_cancelled();
        assert_eq!(set.len(), 2);
        assert_eq!(set.active_ids(), vec![a, c]);
    }

    #[test]
    fn ready_binding_round_trips() {
        let mut set = WatchSet::default();
        let a = set.insert(record("/a"));
        set.get(a).unwrap().watcher.set_watch_id(42);
        set.bind_ready(42, a);
        assert_eq!(set.ready_record(42), Some(a));
        assert_eq!(set.unbind_ready(42), Some(a));
        assert_eq!(set.ready_record(42), None);
    }

    #[test]
    fn uuid_pending_matches_out_of_order() {
        let mut set = WatchSet::default();
        let a = set.insert(record("/a"));
        let b = set.insert(record("/b"));
        set.set_pending_uuid("u-a".into(), a);
        set.set_pending_uuid("u-b".into(), b);
        assert_eq!(set.take_pending_uuid("u-b"), Some(b));
        assert_eq!(set.take_pending_uuid("u-b"), None);
        assert_eq!(set.take_pending_uuid("u-a"), Some(a));
    }
}
