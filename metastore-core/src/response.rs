//! Decoded responses handed to callers.
//!
//! These mirror the wire messages but hold only the fields the client
//! surface exposes, with the table prefix already trimmed from every key.

use crate::prefix;
use crate::proto::{election, mvcc, rpc};

/// Header attached to every backend reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cluster_id: u64,
    pub member_id: u64,
    /// The key-value store revision when the request was applied.
    pub revision: i64,
    pub raft_term: u64,
}

impl From<&rpc::ResponseHeader> for ResponseHeader {
    fn from(header: &rpc::ResponseHeader) -> Self {
        Self {
            cluster_id: header.cluster_id,
            member_id: header.member_id,
            revision: header.revision,
            raft_term: header.raft_term,
        }
    }
}

impl ResponseHeader {
    pub fn from_proto(header: Option<&rpc::ResponseHeader>) -> Self {
        header.map(Self::from).unwrap_or_default()
    }
}

fn trim_kv(table_prefix: &str, mut kv: mvcc::KeyValue) -> mvcc::KeyValue {
    kv.key = prefix::trim_prefix(table_prefix, &kv.key);
    kv
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PutResponse {
    pub header: ResponseHeader,
    /// The overwritten key-value, when requested.
    pub prev_kv: Option<mvcc::KeyValue>,
}

impl PutResponse {
    pub fn from_proto(table_prefix: &str, response: rpc::PutResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            prev_kv: response.prev_kv.map(|kv| trim_kv(table_prefix, kv)),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<mvcc::KeyValue>,
    /// Number of matching keys, for count-only queries.
    pub count: i64,
}

impl GetResponse {
    pub fn from_proto(table_prefix: &str, response: rpc::RangeResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            kvs: response
                .kvs
                .into_iter()
                .map(|kv| trim_kv(table_prefix, kv))
                .collect(),
            count: response.count,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    /// The number of keys deleted.
    pub deleted: i64,
    pub prev_kvs: Vec<mvcc::KeyValue>,
}

impl DeleteResponse {
    pub fn from_proto(table_prefix: &str, response: rpc::DeleteRangeResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            deleted: response.deleted,
            prev_kvs: response
                .prev_kvs
                .into_iter()
                .map(|kv| trim_kv(table_prefix, kv))
                .collect(),
        }
    }
}

/// One operation's result inside a transaction response.
#[derive(Clone, Debug, PartialEq)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Delete(DeleteResponse),
    Get(GetResponse),
}

impl TxnOpResponse {
    pub fn header(&self) -> &ResponseHeader {
        match self {
            TxnOpResponse::Put(response) => &response.header,
            TxnOpResponse::Delete(response) => &response.header,
            TxnOpResponse::Get(response) => &response.header,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    /// Whether the compare block evaluated to true.
    pub success: bool,
    pub responses: Vec<TxnOpResponse>,
}

impl TxnResponse {
    pub fn from_proto(table_prefix: &str, response: rpc::TxnResponse) -> Self {
        let responses = response
            .responses
            .into_iter()
            .filter_map(|op| match op.response {
                Some(rpc::response_op::Response::ResponsePut(put)) => {
                    Some(TxnOpResponse::Put(PutResponse::from_proto(table_prefix, put)))
                }
                Some(rpc::response_op::Response::ResponseDeleteRange(delete)) => Some(
                    TxnOpResponse::Delete(DeleteResponse::from_proto(table_prefix, delete)),
                ),
                Some(rpc::response_op::Response::ResponseRange(range)) => {
                    Some(TxnOpResponse::Get(GetResponse::from_proto(table_prefix, range)))
                }
                None => None,
            })
            .collect();
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            success: response.succeeded,
            responses,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub lease_id: i64,
    /// Server-chosen time-to-live in seconds.
    pub ttl: i64,
}

impl From<rpc::LeaseGrantResponse> for LeaseGrantResponse {
    fn from(response: rpc::LeaseGrantResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            lease_id: response.id,
            ttl: response.ttl,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaseRevokeResponse {
    pub header: ResponseHeader,
}

impl From<rpc::LeaseRevokeResponse> for LeaseRevokeResponse {
    fn from(response: rpc::LeaseRevokeResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaseKeepAliveResponse {
    pub header: ResponseHeader,
    pub lease_id: i64,
    /// The refreshed time-to-live. Zero means the lease has expired.
    pub ttl: i64,
}

impl From<rpc::LeaseKeepAliveResponse> for LeaseKeepAliveResponse {
    fn from(response: rpc::LeaseKeepAliveResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            lease_id: response.id,
            ttl: response.ttl,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusResponse {
    pub header: ResponseHeader,
    pub version: String,
    pub errors: Vec<String>,
}

impl From<rpc::StatusResponse> for StatusResponse {
    fn from(response: rpc::StatusResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            version: response.version,
            errors: response.errors,
        }
    }
}

/// The resources held while owning leadership of an election.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaderKey {
    /// The election identifier, with the table prefix trimmed.
    pub name: String,
    /// An opaque key representing ownership; losing the key loses leadership.
    pub key: String,
    /// Creation revision of the ownership key.
    pub rev: i64,
    /// Lease backing the leadership.
    pub lease: i64,
}

impl LeaderKey {
    pub fn from_proto(table_prefix: &str, leader: election::LeaderKey) -> Self {
        Self {
            name: prefix::trim_prefix_str(table_prefix, &leader.name),
            key: prefix::trim_prefix_str(table_prefix, &leader.key),
            rev: leader.rev,
            lease: leader.lease,
        }
    }

    pub fn to_proto(&self, table_prefix: &str) -> election::LeaderKey {
        election::LeaderKey {
            name: prefix::prefix_key(table_prefix, &self.name),
            key: prefix::prefix_key(table_prefix, &self.key),
            rev: self.rev,
            lease: self.lease,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CampaignResponse {
    pub header: ResponseHeader,
    pub leader: LeaderKey,
}

impl CampaignResponse {
    pub fn from_proto(table_prefix: &str, response: election::CampaignResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            leader: response
                .leader
                .map(|leader| LeaderKey::from_proto(table_prefix, leader))
                .unwrap_or_default(),
        }
    }
}

/// The latest leader update: the leadership key and the proclaimed value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaderResponse {
    pub header: ResponseHeader,
    /// Leadership key with the table prefix trimmed.
    pub key: String,
    /// The winning proposal.
    pub value: Vec<u8>,
}

impl LeaderResponse {
    pub fn from_proto(table_prefix: &str, response: election::LeaderResponse) -> Self {
        let kv = response.kv.unwrap_or_default();
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
            key: prefix::trim_prefix_str(table_prefix, &kv.key),
            value: kv.value,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResignResponse {
    pub header: ResponseHeader,
}

impl ResignResponse {
    pub fn from_proto(response: election::ResignResponse) -> Self {
        Self {
            header: ResponseHeader::from_proto(response.header.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_response_decodes_every_op_kind() {
        let raw = rpc::TxnResponse {
            header: Some(rpc::ResponseHeader {
                revision: 7,
                ..Default::default()
            }),
            succeeded: true,
            responses: vec![
                rpc::ResponseOp {
                    response: Some(rpc::response_op::Response::ResponsePut(rpc::PutResponse {
                        prev_kv: Some(mvcc::KeyValue {
                            key: b"/p/a".to_vec(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })),
                },
                rpc::ResponseOp {
                    response: Some(rpc::response_op::Response::ResponseDeleteRange(
                        rpc::DeleteRangeResponse {
                            deleted: 2,
                            ..Default::default()
                        },
                    )),
                },
                rpc::ResponseOp {
                    response: Some(rpc::response_op::Response::ResponseRange(
                        rpc::RangeResponse {
                            count: 1,
                            ..Default::default()
                        },
                    )),
                },
            ],
        };
        let decoded = TxnResponse::from_proto("/p", raw);
        assert!(decoded.success);
        assert_eq!(decoded.header.revision, 7);
        assert_eq!(decoded.responses.len(), 3);
        match &decoded.responses[0] {
            TxnOpResponse::Put(put) => {
                assert_eq!(put.prev_kv.as_ref().unwrap().key, b"/a");
            }
            other => panic!("expected put response, got {other:?}"),
        }
    }

    #[test]
    fn leader_key_round_trips_through_prefix() {
        let key = LeaderKey {
            name: "/leader".into(),
            key: "/leader/123".into(),
            rev: 4,
            lease: 9,
        };
        let wire = key.to_proto("/t");
        assert_eq!(wire.name, b"/t/leader");
        assert_eq!(LeaderKey::from_proto("/t", wire), key);
    }
}
