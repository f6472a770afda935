//! Hand-maintained prost messages matching the etcd v3 wire format.
//!
//! The structs mirror `etcdserverpb`, `mvccpb` and `v3electionpb` exactly
//! (field names, numbers and types), so the bytes produced here are
//! interchangeable with etcd's own generated code. Only the subset of the
//! API this client speaks is kept.

pub mod election;
pub mod mvcc;
pub mod peer;
pub mod rpc;
