//! Watch event model delivered to observers.

use crate::prefix;
use crate::proto::{mvcc, rpc};

/// The kind of mutation a watch event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single translated watch event.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kv: mvcc::KeyValue,
    pub prev_kv: Option<mvcc::KeyValue>,
}

impl WatchEvent {
    /// Translate the events of a raw watch response, trimming the table
    /// prefix from every key. Unknown event types are skipped.
    pub fn from_response(prefix: &str, response: &rpc::WatchResponse) -> Vec<WatchEvent> {
        response
            .events
            .iter()
            .filter_map(|event| Self::from_proto(prefix, event))
            .collect()
    }

    pub fn from_proto(table_prefix: &str, event: &mvcc::Event) -> Option<WatchEvent> {
        let event_type = match mvcc::event::EventType::try_from(event.r#type) {
            Ok(mvcc::event::EventType::Put) => EventType::Put,
            Ok(mvcc::event::EventType::Delete) => EventType::Delete,
            Err(_) => return None,
        };
        let mut kv = event.kv.clone().unwrap_or_default();
        kv.key = prefix::trim_prefix(table_prefix, &kv.key);
        let prev_kv = event.prev_kv.clone().map(|mut prev| {
            prev.key = prefix::trim_prefix(table_prefix, &prev.key);
            prev
        });
        Some(WatchEvent {
            event_type,
            kv,
            prev_kv,
        })
    }
}

/// Outcome of a resynchronization run after a compaction cancel: the
/// revision the watch should resume from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncResult {
    pub revision: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(key: &[u8], value: &[u8]) -> mvcc::KeyValue {
        mvcc::KeyValue {
            key: key.to_vec(),
            value: value.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn translates_and_trims() {
        let response = rpc::WatchResponse {
            events: vec![
                mvcc::Event {
                    r#type: mvcc::event::EventType::Put as i32,
                    kv: Some(kv(b"/p/a", b"1")),
                    prev_kv: Some(kv(b"/p/a", b"0")),
                },
                mvcc::Event {
                    r#type: mvcc::event::EventType::Delete as i32,
                    kv: Some(kv(b"/p/b", b"")),
                    prev_kv: None,
                },
            ],
            ..Default::default()
        };
        let events = WatchEvent::from_response("/p", &response);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::Put);
        assert_eq!(events[0].kv.key, b"/a");
        assert_eq!(events[0].prev_kv.as_ref().unwrap().key, b"/a");
        assert_eq!(events[1].event_type, EventType::Delete);
        assert_eq!(events[1].kv.key, b"/b");
    }
}
