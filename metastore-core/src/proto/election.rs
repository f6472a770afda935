//! `v3electionpb` messages for the election service.

use super::{mvcc, rpc};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CampaignRequest {
    /// name is the election's identifier for the campaign.
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,
    /// lease is the ID of the lease attached to leadership of the election.
    /// If the lease expires or is revoked before resigning leadership, then
    /// the leadership is transferred to the next campaigner, if any.
    #[prost(int64, tag = "2")]
    pub lease: i64,
    /// value is the initial proclaimed value set when the campaigner wins
    /// the election.
    #[prost(bytes = "vec", tag = "3")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CampaignResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<rpc::ResponseHeader>,
    /// leader describes the resources used for holding leadership of the
    /// election.
    #[prost(message, optional, tag = "2")]
    pub leader: Option<LeaderKey>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaderKey {
    /// name is the election identifier that corresponds to the leadership key.
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,
    /// key is an opaque key representing the ownership of the election. If
    /// the key is deleted, then leadership is lost.
    #[prost(bytes = "vec", tag = "2")]
    pub key: Vec<u8>,
    /// rev is the creation revision of the key. It can be used to test for
    /// ownership of an election during transactions by testing the key's
    /// creation revision matches rev.
    #[prost(int64, tag = "3")]
    pub rev: i64,
    /// lease is the lease ID of the election leader.
    #[prost(int64, tag = "4")]
    pub lease: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaderRequest {
    /// name is the election identifier for the leadership information.
    #[prost(bytes = "vec", tag = "1")]
    pub name: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LeaderResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<rpc::ResponseHeader>,
    /// kv is the key-value pair representing the latest leader update.
    #[prost(message, optional, tag = "2")]
    pub kv: Option<mvcc::KeyValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResignRequest {
    /// leader is the leadership to relinquish by resignation.
    #[prost(message, optional, tag = "1")]
    pub leader: Option<LeaderKey>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResignResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<rpc::ResponseHeader>,
}
