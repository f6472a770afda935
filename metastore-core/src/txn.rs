//! Transaction builder.
//!
//! Composes an atomic if/then/else request the way callers write it:
//!
//! ```
//! use metastore_core::{CmpOp, PutOptions, Txn, TxnCmp, TxnOp};
//!
//! let request = Txn::new()
//!     .when(TxnCmp::version("/k", CmpOp::Equal, 0))
//!     .and_then(TxnOp::put("/k", "v", PutOptions::default()))
//!     .or_else(TxnOp::get("/k", Default::default()))
//!     .build("")
//!     .unwrap();
//! assert_eq!(request.compare.len(), 1);
//! ```

use crate::error::Error;
use crate::params::{DeleteOptions, GetOptions, PutOptions};
use crate::prefix;
use crate::proto::rpc;

/// Logical comparison operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Equal,
    Greater,
    Less,
    NotEqual,
}

impl From<CmpOp> for rpc::compare::CompareResult {
    fn from(op: CmpOp) -> Self {
        match op {
            CmpOp::Equal => rpc::compare::CompareResult::Equal,
            CmpOp::Greater => rpc::compare::CompareResult::Greater,
            CmpOp::Less => rpc::compare::CompareResult::Less,
            CmpOp::NotEqual => rpc::compare::CompareResult::NotEqual,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum CmpTarget {
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Value(Vec<u8>),
    Lease(i64),
}

/// A single comparison in a transaction's compare block.
#[derive(Clone, Debug, PartialEq)]
pub struct TxnCmp {
    key: String,
    op: CmpOp,
    target: CmpTarget,
}

impl TxnCmp {
    pub fn version(key: impl Into<String>, op: CmpOp, version: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CmpTarget::Version(version),
        }
    }

    pub fn create_revision(key: impl Into<String>, op: CmpOp, revision: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CmpTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, op: CmpOp, revision: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CmpTarget::ModRevision(revision),
        }
    }

    pub fn value(key: impl Into<String>, op: CmpOp, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            op,
            target: CmpTarget::Value(value.into()),
        }
    }

    pub fn lease(key: impl Into<String>, op: CmpOp, lease_id: i64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CmpTarget::Lease(lease_id),
        }
    }

    fn build(&self, table_prefix: &str) -> rpc::Compare {
        let (target, target_union) = match &self.target {
            CmpTarget::Version(version) => (
                rpc::compare::CompareTarget::Version,
                rpc::compare::TargetUnion::Version(*version),
            ),
            CmpTarget::CreateRevision(revision) => (
                rpc::compare::CompareTarget::Create,
                rpc::compare::TargetUnion::CreateRevision(*revision),
            ),
            CmpTarget::ModRevision(revision) => (
                rpc::compare::CompareTarget::Mod,
                rpc::compare::TargetUnion::ModRevision(*revision),
            ),
            CmpTarget::Value(value) => (
                rpc::compare::CompareTarget::Value,
                rpc::compare::TargetUnion::Value(value.clone()),
            ),
            CmpTarget::Lease(lease_id) => (
                rpc::compare::CompareTarget::Lease,
                rpc::compare::TargetUnion::Lease(*lease_id),
            ),
        };
        rpc::Compare {
            result: rpc::compare::CompareResult::from(self.op) as i32,
            target: target as i32,
            key: prefix::prefix_key(table_prefix, &self.key),
            target_union: Some(target_union),
            range_end: Vec::new(),
        }
    }
}

/// One operation in a transaction's then/else block.
#[derive(Clone, Debug, PartialEq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        options: PutOptions,
    },
    Delete {
        key: String,
        options: DeleteOptions,
    },
    Get {
        key: String,
        options: GetOptions,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>, options: PutOptions) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            options,
        }
    }

    pub fn delete(key: impl Into<String>, options: DeleteOptions) -> Self {
        TxnOp::Delete {
            key: key.into(),
            options,
        }
    }

    pub fn get(key: impl Into<String>, options: GetOptions) -> Self {
        TxnOp::Get {
            key: key.into(),
            options,
        }
    }

    /// The replication flag carried by this op. Gets are always async.
    pub fn async_backup(&self) -> bool {
        match self {
            TxnOp::Put { options, .. } => options.async_backup,
            TxnOp::Delete { options, .. } => options.async_backup,
            TxnOp::Get { .. } => true,
        }
    }

    fn build(&self, table_prefix: &str) -> rpc::RequestOp {
        let request = match self {
            TxnOp::Put {
                key,
                value,
                options,
            } => rpc::request_op::Request::RequestPut(rpc::PutRequest {
                key: prefix::prefix_key(table_prefix, key),
                value: value.clone(),
                lease: options.lease_id,
                prev_kv: options.prev_kv,
                ..Default::default()
            }),
            TxnOp::Delete { key, options } => {
                let wire_key = prefix::prefix_key(table_prefix, key);
                let range_end = if options.prefix {
                    prefix::prefix_range_end(&wire_key)
                } else {
                    Vec::new()
                };
                rpc::request_op::Request::RequestDeleteRange(rpc::DeleteRangeRequest {
                    key: wire_key,
                    range_end,
                    prev_kv: options.prev_kv,
                })
            }
            TxnOp::Get { key, options } => {
                let wire_key = prefix::prefix_key(table_prefix, key);
                let range_end = if options.prefix {
                    prefix::prefix_range_end(&wire_key)
                } else {
                    Vec::new()
                };
                rpc::request_op::Request::RequestRange(options.build_range(wire_key, range_end))
            }
        };
        rpc::RequestOp {
            request: Some(request),
        }
    }
}

/// Builder for an atomic if/then/else transaction.
///
/// The blocks must be composed in order: every `when` before any `and_then`,
/// every `and_then` before any `or_else`. Misordered builders are rejected
/// at [`Txn::build`] time.
#[derive(Clone, Debug, Default)]
pub struct Txn {
    compares: Vec<TxnCmp>,
    then_ops: Vec<TxnOp>,
    else_ops: Vec<TxnOp>,
    misordered: Option<&'static str>,
}

impl Txn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, compare: TxnCmp) -> Self {
        if !self.then_ops.is_empty() || !self.else_ops.is_empty() {
            self.misordered = Some("when() must precede and_then()/or_else()");
        }
        self.compares.push(compare);
        self
    }

    #[must_use]
    pub fn and_then(mut self, op: TxnOp) -> Self {
        if !self.else_ops.is_empty() {
            self.misordered = Some("and_then() must precede or_else()");
        }
        self.then_ops.push(op);
        self
    }

    #[must_use]
    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.else_ops.push(op);
        self
    }

    /// Whether every mutating op in the transaction allows asynchronous
    /// backup. A single synchronous op makes the whole commit synchronous.
    pub fn async_backup(&self) -> bool {
        self.then_ops
            .iter()
            .chain(self.else_ops.iter())
            .all(TxnOp::async_backup)
    }

    /// Number of ops executed when the compare block succeeds.
    pub fn then_len(&self) -> usize {
        self.then_ops.len()
    }

    /// Encode into a wire request, namespacing every key with `table_prefix`.
    pub fn build(&self, table_prefix: &str) -> Result<rpc::TxnRequest, Error> {
        if let Some(reason) = self.misordered {
            return Err(Error::TxnOrder(reason));
        }
        Ok(rpc::TxnRequest {
            compare: self
                .compares
                .iter()
                .map(|compare| compare.build(table_prefix))
                .collect(),
            success: self.then_ops.iter().map(|op| op.build(table_prefix)).collect(),
            failure: self.else_ops.iter().map(|op| op.build(table_prefix)).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_compare_then_else() {
        let request = Txn::new()
            .when(TxnCmp::value("/k", CmpOp::Equal, "1.0"))
            .and_then(TxnOp::delete("/k", DeleteOptions::default().with_prev_kv()))
            .and_then(TxnOp::put("/k2", "2.0", PutOptions::default().with_prev_kv()))
            .or_else(TxnOp::get("/k", GetOptions::default().with_limit(1)))
            .build("/t")
            .unwrap();

        assert_eq!(request.compare.len(), 1);
        assert_eq!(request.compare[0].key, b"/t/k");
        assert_eq!(
            request.compare[0].target_union,
            Some(rpc::compare::TargetUnion::Value(b"1.0".to_vec()))
        );
        assert_eq!(request.success.len(), 2);
        assert_eq!(request.failure.len(), 1);
        match &request.failure[0].request {
            Some(rpc::request_op::Request::RequestRange(range)) => {
                assert_eq!(range.key, b"/t/k");
                assert_eq!(range.limit, 1);
            }
            other => panic!("expected range request, got {other:?}"),
        }
    }

    #[test]
    fn prefix_delete_gets_range_end() {
        let request = Txn::new()
            .and_then(TxnOp::delete("/dir/", DeleteOptions::default().with_prefix()))
            .build("")
            .unwrap();
        match &request.success[0].request {
            Some(rpc::request_op::Request::RequestDeleteRange(delete)) => {
                assert_eq!(delete.key, b"/dir/");
                assert_eq!(delete.range_end, b"/dir0");
            }
            other => panic!("expected delete request, got {other:?}"),
        }
    }

    #[test]
    fn when_after_then_is_rejected() {
        let err = Txn::new()
            .and_then(TxnOp::get("/k", GetOptions::default()))
            .when(TxnCmp::version("/k", CmpOp::Equal, 0))
            .build("")
            .unwrap_err();
        assert!(matches!(err, Error::TxnOrder(_)));
    }

    #[test]
    fn sync_backup_op_flips_the_commit() {
        let txn = Txn::new().and_then(TxnOp::put(
            "/k",
            "v",
            PutOptions {
                async_backup: false,
                ..Default::default()
            },
        ));
        assert!(!txn.async_backup());
        assert!(Txn::new()
            .and_then(TxnOp::get("/k", GetOptions::default()))
            .async_backup());
    }
}
