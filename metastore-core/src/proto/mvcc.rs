//! `mvccpb` key-value and event messages.

/// A single stored key-value record together with its revision counters.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyValue {
    /// key is the key in bytes. An empty key is not allowed.
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    /// the revision of last creation on this key.
    #[prost(int64, tag = "2")]
    pub create_revision: i64,
    /// the revision of last modification on this key.
    #[prost(int64, tag = "3")]
    pub mod_revision: i64,
    /// the version of the key. A deletion resets the version to zero and any
    /// modification of the key increases its version.
    #[prost(int64, tag = "4")]
    pub version: i64,
    #[prost(bytes = "vec", tag = "5")]
    pub value: Vec<u8>,
    /// the ID of the lease that attached to key. When the attached lease
    /// expires, the key will be deleted. Zero means no lease.
    #[prost(int64, tag = "6")]
    pub lease: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(enumeration = "event::EventType", tag = "1")]
    pub r#type: i32,
    /// kv holds the KeyValue for the event. A PUT event contains current kv;
    /// a DELETE/EXPIRE event contains the deleted key with its modification
    /// revision set to the revision of deletion.
    #[prost(message, optional, tag = "2")]
    pub kv: Option<KeyValue>,
    /// prev_kv holds the key-value pair before the event happens.
    #[prost(message, optional, tag = "3")]
    pub prev_kv: Option<KeyValue>,
}

pub mod event {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum EventType {
        Put = 0,
        Delete = 1,
    }
}
