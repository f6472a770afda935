//! Envelopes exchanged with the peer metastore service in proxy mode.
//!
//! Every request carries a v4 UUID so the reply can be correlated with its
//! in-flight entry; the inner payload is a serialized etcd-style message
//! from [`super::rpc`] or [`super::election`].

/// Outbound envelope carrying a serialized inner request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaStoreRequest {
    /// requestId is a v4 UUID in ASCII form, echoed back in the reply.
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// requestMsg is the serialized inner etcd-style request.
    #[prost(bytes = "vec", tag = "2")]
    pub request_msg: Vec<u8>,
    /// asyncBackup propagates the mutating-op replication flag.
    #[prost(bool, tag = "3")]
    pub async_backup: bool,
}

/// Inbound envelope carrying a serialized inner response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaStoreResponse {
    /// responseId echoes the requestId it answers.
    #[prost(string, tag = "1")]
    pub response_id: String,
    /// status is zero on success, else a status code.
    #[prost(int32, tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub error_msg: String,
    /// responseMsg is the serialized inner etcd-style response.
    #[prost(bytes = "vec", tag = "4")]
    pub response_msg: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObserveCancelRequest {
    #[prost(uint64, tag = "1")]
    pub cancel_observe_id: u64,
}

/// Reply variant for the proxied observe stream. Exactly one of
/// `is_create` / `is_cancel` is set for control replies; both false means
/// a leader event whose payload decodes into a `LeaderResponse`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObserveResponse {
    #[prost(string, tag = "1")]
    pub response_id: String,
    #[prost(bool, tag = "2")]
    pub is_create: bool,
    #[prost(bool, tag = "3")]
    pub is_cancel: bool,
    #[prost(uint64, tag = "4")]
    pub observe_id: u64,
    #[prost(bytes = "vec", tag = "5")]
    pub name: Vec<u8>,
    #[prost(string, tag = "6")]
    pub cancel_msg: String,
    /// serialized inner LeaderResponse for event replies.
    #[prost(bytes = "vec", tag = "7")]
    pub response_msg: Vec<u8>,
}
