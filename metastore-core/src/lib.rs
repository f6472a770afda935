//! Core wire types for the metastore client.
//!
//! This crate contains the protobuf messages spoken on the wire (the etcd v3
//! KV / Watch / Lease / Maintenance / Election APIs plus the peer-service
//! envelopes used in proxy mode), the decoded response structs handed to
//! callers, the request option types, and the transaction builder.
//!
//! Nothing in here performs I/O; transports live in `metastore-client`.

pub mod error;
pub mod params;
pub mod prefix;
pub mod proto;
pub mod response;
pub mod txn;
pub mod watch;

pub use error::Error;
pub use params::{DeleteOptions, GetOptions, PutOptions, SortOrder, SortTarget, WatchOptions};
pub use response::{
    CampaignResponse, DeleteResponse, GetResponse, LeaderKey, LeaderResponse, LeaseGrantResponse,
    LeaseKeepAliveResponse, LeaseRevokeResponse, PutResponse, ResignResponse, ResponseHeader,
    StatusResponse, TxnOpResponse, TxnResponse,
};
pub use txn::{CmpOp, Txn, TxnCmp, TxnOp};
pub use watch::{EventType, SyncResult, WatchEvent};

pub type Result<T, E = Error> = std::result::Result<T, E>;
