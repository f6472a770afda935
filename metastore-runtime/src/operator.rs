//! Transaction templates over an instance record and its route record.
//!
//! Each operation is one atomic transaction with a version precondition;
//! the else-branch reads the conflicting record so failures can be decoded
//! into either a benign duplicate (same value already stored) or a real
//! version conflict carrying the observed value and revision.

use std::sync::Arc;

use async_trait::async_trait;
use metastore_client::MetastoreClient;
use metastore_core::{
    CmpOp, DeleteOptions, GetOptions, GetResponse, PutOptions, Txn, TxnCmp, TxnOp, TxnOpResponse,
    TxnResponse,
};
use thiserror::Error;
use tracing::{debug, error, info};

/// Errors from instance bookkeeping.
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The transaction precondition failed against a different value.
    #[error("version is incorrect, stored revision {mod_revision}")]
    WrongVersion {
        /// The value actually stored.
        value: Vec<u8>,
        mod_revision: i64,
    },

    /// The transaction returned a different number of op-responses than
    /// requested; unrecoverable.
    #[error("transaction returned {got} responses, expected {expected}")]
    WrongResponseSize { expected: usize, got: usize },

    /// A delete affected no keys where at least one was expected.
    #[error("failed to delete instance record")]
    DeleteFailed,

    /// The else-branch did not contain the expected read.
    #[error("failed to read conflicting record: {0}")]
    GetInfoFailed(&'static str),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error(transparent)]
    Client(#[from] metastore_client::Error),
}

pub type OperatorResult<T> = std::result::Result<T, OperatorError>;

/// One record to persist: its key and serialized value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreInfo {
    pub key: String,
    pub value: Vec<u8>,
}

impl StoreInfo {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Outcome of a successful instance operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperateResult {
    /// The stored value, when the operation had to read it back.
    pub value: Vec<u8>,
    /// The per-key version after the operation.
    pub version: i64,
    /// The global revision of the applying transaction.
    pub revision: i64,
}

/// The slice of the client surface the operator consumes; tests supply a
/// fake.
#[async_trait]
pub trait TxnStore: Send + Sync {
    async fn commit(&self, txn: &Txn) -> metastore_client::Result<TxnResponse>;
    async fn get(&self, key: &str, options: GetOptions) -> metastore_client::Result<GetResponse>;
}

#[async_trait]
impl TxnStore for MetastoreClient {
    async fn commit(&self, txn: &Txn) -> metastore_client::Result<TxnResponse> {
        MetastoreClient::commit(self, txn).await
    }

    async fn get(&self, key: &str, options: GetOptions) -> metastore_client::Result<GetResponse> {
        MetastoreClient::get(self, key, options).await
    }
}

/// How a create/modify transaction landed: applied as written, or lost the
/// race to an identical record already stored.
enum Upsert {
    Applied {
        revision: i64,
    },
    Duplicate {
        value: Vec<u8>,
        stored_version: i64,
        revision: i64,
    },
}

/// Instance record bookkeeping on top of the KV transaction surface.
pub struct InstanceOperator {
    store: Arc<dyn TxnStore>,
}

impl InstanceOperator {
    pub fn new(store: Arc<dyn TxnStore>) -> Self {
        Self { store }
    }

    /// Create the instance (and optional route) records, requiring both
    /// keys to be absent. Re-creating with an identical value succeeds.
    pub async fn create(
        &self,
        instance: &StoreInfo,
        route: Option<&StoreInfo>,
        low_reliability: bool,
    ) -> OperatorResult<OperateResult> {
        Self::require_key(&instance.key)?;
        let put_options = PutOptions {
            lease_id: 0,
            prev_kv: false,
            async_backup: low_reliability,
        };
        let mut expected = 1;
        let mut txn = Txn::new().when(TxnCmp::version(instance.key.as_str(), CmpOp::Equal, 0));
        if let Some(route) = route {
            txn = txn.when(TxnCmp::version(route.key.as_str(), CmpOp::Equal, 0));
        }
        txn = txn.and_then(TxnOp::put(
            instance.key.as_str(),
            instance.value.clone(),
            put_options.clone(),
        ));
        if let Some(route) = route {
            txn = txn.and_then(TxnOp::put(route.key.as_str(), route.value.clone(), put_options));
            expected += 1;
        }
        let txn = txn.or_else(TxnOp::get(
            instance.key.as_str(),
            GetOptions::default().with_limit(1),
        ));

        debug!(key = %instance.key, "creating instance record");
        let response = self.store.commit(&txn).await?;
        Self::decode_create(&instance.key, &instance.value, expected, response)
    }

    /// Replace the records, requiring the stored version to match.
    pub async fn modify(
        &self,
        instance: &StoreInfo,
        route: Option<&StoreInfo>,
        version: i64,
        low_reliability: bool,
    ) -> OperatorResult<OperateResult> {
        Self::require_key(&instance.key)?;
        let put_options = PutOptions {
            lease_id: 0,
            prev_kv: false,
            async_backup: low_reliability,
        };
        let mut expected = 1;
        let mut txn = Txn::new()
            .when(TxnCmp::version(instance.key.as_str(), CmpOp::Equal, version))
            .and_then(TxnOp::put(
                instance.key.as_str(),
                instance.value.clone(),
                put_options.clone(),
            ));
        if let Some(route) = route {
            txn = txn.and_then(TxnOp::put(route.key.as_str(), route.value.clone(), put_options));
            expected += 1;
        }
        let txn = txn.or_else(TxnOp::get(
            instance.key.as_str(),
            GetOptions::default().with_limit(1),
        ));

        debug!(key = %instance.key, version, "modifying instance record");
        let response = self.store.commit(&txn).await?;
        Self::decode_modify(&instance.key, &instance.value, expected, version, response)
    }

    /// Delete the records, requiring the stored version to match.
    pub async fn delete(
        &self,
        instance_key: &str,
        route_key: Option<&str>,
        debug_key: Option<&str>,
        version: i64,
    ) -> OperatorResult<OperateResult> {
        Self::require_key(instance_key)?;
        let mut expected = 1;
        let mut txn = Txn::new()
            .when(TxnCmp::version(instance_key, CmpOp::Equal, version))
            .and_then(TxnOp::delete(instance_key, DeleteOptions::default()));
        for key in [route_key, debug_key].into_iter().flatten() {
            txn = txn.and_then(TxnOp::delete(key, DeleteOptions::default()));
            expected += 1;
        }
        let txn = txn.or_else(TxnOp::get(
            instance_key,
            GetOptions::default().with_limit(1),
        ));

        debug!(key = instance_key, version, "deleting instance record");
        let response = self.store.commit(&txn).await?;

        if !response.success {
            let conflict = Self::conflict_from(&response)?;
            return Err(conflict);
        }
        if response.responses.len() != expected {
            error!(
                key = instance_key,
                got = response.responses.len(),
                expected,
                "unexpected delete response size"
            );
            return Err(OperatorError::WrongResponseSize {
                expected,
                got: response.responses.len(),
            });
        }
        match response.responses.first() {
            Some(TxnOpResponse::Delete(delete)) if delete.deleted > 0 => Ok(OperateResult {
                revision: response.header.revision,
                ..Default::default()
            }),
            Some(TxnOpResponse::Delete(_)) => Err(OperatorError::DeleteFailed),
            _ => Err(OperatorError::GetInfoFailed("operation type is wrong")),
        }
    }

    /// Delete the records regardless of the stored state.
    pub async fn force_delete(
        &self,
        instance_key: &str,
        route_key: Option<&str>,
        debug_key: Option<&str>,
    ) -> OperatorResult<OperateResult> {
        Self::require_key(instance_key)?;
        let mut expected = 1;
        let mut txn = Txn::new().when(TxnCmp::value(instance_key, CmpOp::NotEqual, ""));
        // both branches delete; the precondition only routes the response
        txn = txn.and_then(TxnOp::delete(instance_key, DeleteOptions::default()));
        for key in [route_key, debug_key].into_iter().flatten() {
            txn = txn.and_then(TxnOp::delete(key, DeleteOptions::default()));
            expected += 1;
        }
        txn = txn.or_else(TxnOp::delete(instance_key, DeleteOptions::default()));
        for key in [route_key, debug_key].into_iter().flatten() {
            txn = txn.or_else(TxnOp::delete(key, DeleteOptions::default()));
        }

        info!(key = instance_key, "force deleting instance record");
        let response = self.store.commit(&txn).await?;
        if response.responses.len() != expected {
            return Err(OperatorError::WrongResponseSize {
                expected,
                got: response.responses.len(),
            });
        }
        Ok(OperateResult {
            revision: response.header.revision,
            ..Default::default()
        })
    }

    /// Read the instance record's value and revision. A plain read carries
    /// no meaningful version, so it is reported as zero.
    pub async fn get(&self, instance_key: &str) -> OperatorResult<OperateResult> {
        Self::require_key(instance_key)?;
        let response = self
            .store
            .get(instance_key, GetOptions::default().with_limit(1))
            .await?;
        let Some(kv) = response.kvs.first() else {
            return Err(OperatorError::GetInfoFailed("record not found"));
        };
        Ok(OperateResult {
            value: kv.value.clone(),
            version: 0,
            revision: kv.mod_revision,
        })
    }

    fn require_key(key: &str) -> OperatorResult<()> {
        if key.is_empty() {
            return Err(OperatorError::InvalidParameter(
                "instance key must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Decode a create response: success requires the expected op count; a
    /// failed precondition against an identical stored value still counts as
    /// success (duplicate re-create resilience), reported like a fresh
    /// create with no value or version.
    fn decode_create(
        key: &str,
        value: &[u8],
        expected: usize,
        response: TxnResponse,
    ) -> OperatorResult<OperateResult> {
        match Self::classify_upsert(key, value, expected, response)? {
            Upsert::Applied { revision } | Upsert::Duplicate { revision, .. } => Ok(OperateResult {
                value: Vec::new(),
                version: 0,
                revision,
            }),
        }
    }

    /// Decode a modify response. The duplicate branch reports the stored
    /// value and the version it was written against (one before the stored
    /// record's).
    fn decode_modify(
        key: &str,
        value: &[u8],
        expected: usize,
        version: i64,
        response: TxnResponse,
    ) -> OperatorResult<OperateResult> {
        match Self::classify_upsert(key, value, expected, response)? {
            Upsert::Applied { revision } => Ok(OperateResult {
                value: Vec::new(),
                version,
                revision,
            }),
            Upsert::Duplicate {
                value,
                stored_version,
                revision,
            } => Ok(OperateResult {
                value,
                version: (stored_version - 1).max(0),
                revision,
            }),
        }
    }

    /// Shared create/modify response classification: applied, benign
    /// duplicate, or a real failure.
    fn classify_upsert(
        key: &str,
        value: &[u8],
        expected: usize,
        response: TxnResponse,
    ) -> OperatorResult<Upsert> {
        if response.success {
            if response.responses.len() != expected {
                error!(
                    key,
                    got = response.responses.len(),
                    expected,
                    "unexpected upsert response size"
                );
                return Err(OperatorError::WrongResponseSize {
                    expected,
                    got: response.responses.len(),
                });
            }
            return Ok(Upsert::Applied {
                revision: response.header.revision,
            });
        }

        let get = match response.responses.first() {
            Some(TxnOpResponse::Get(get)) => get,
            _ => return Err(OperatorError::GetInfoFailed("operation type is wrong")),
        };
        let Some(kv) = get.kvs.first() else {
            return Err(OperatorError::GetInfoFailed("conflicting record is gone"));
        };
        if kv.value == value {
            info!(key, "txn lost but the stored value matches, treating as success");
            let revision = response
                .responses
                .last()
                .map(|op| op.header().revision)
                .unwrap_or(response.header.revision);
            return Ok(Upsert::Duplicate {
                value: kv.value.clone(),
                stored_version: kv.version,
                revision,
            });
        }
        Err(OperatorError::WrongVersion {
            value: kv.value.clone(),
            mod_revision: kv.mod_revision,
        })
    }

    fn conflict_from(response: &TxnResponse) -> OperatorResult<OperatorError> {
        let get = match response.responses.first() {
            Some(TxnOpResponse::Get(get)) => get,
            _ => return Err(OperatorError::GetInfoFailed("operation type is wrong")),
        };
        let Some(kv) = get.kvs.first() else {
            return Err(OperatorError::GetInfoFailed("conflicting record is gone"));
        };
        Ok(OperatorError::WrongVersion {
            value: kv.value.clone(),
            mod_revision: kv.mod_revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_core::proto::mvcc::KeyValue;
    use metastore_core::{DeleteResponse, PutResponse, ResponseHeader};
    use parking_lot::Mutex;

    /// Returns scripted responses and records the committed transactions.
    #[derive(Default)]
    struct ScriptedStore {
        responses: Mutex<Vec<TxnResponse>>,
        committed: Mutex<Vec<metastore_core::proto::rpc::TxnRequest>>,
    }

    impl ScriptedStore {
        fn with(responses: Vec<TxnResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                committed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TxnStore for ScriptedStore {
        async fn commit(&self, txn: &Txn) -> metastore_client::Result<TxnResponse> {
            self.committed.lock().push(txn.build("").unwrap());
            Ok(self.responses.lock().remove(0))
        }

        async fn get(
            &self,
            _key: &str,
            _options: GetOptions,
        ) -> metastore_client::Result<GetResponse> {
            Ok(GetResponse {
                kvs: vec![KeyValue {
                    key: b"/k".to_vec(),
                    value: b"stored".to_vec(),
                    version: 3,
                    mod_revision: 17,
                    ..Default::default()
                }],
                ..Default::default()
            })
        }
    }

    fn success(ops: usize, revision: i64) -> TxnResponse {
        TxnResponse {
            header: ResponseHeader {
                revision,
                ..Default::default()
            },
            success: true,
            responses: (0..ops)
                .map(|_| TxnOpResponse::Put(PutResponse::default()))
                .collect(),
        }
    }

    fn failed_with_get(value: &[u8], version: i64, mod_revision: i64) -> TxnResponse {
        TxnResponse {
            success: false,
            responses: vec![TxnOpResponse::Get(GetResponse {
                header: ResponseHeader {
                    revision: mod_revision,
                    ..Default::default()
                },
                kvs: vec![KeyValue {
                    key: b"/k".to_vec(),
                    value: value.to_vec(),
                    version,
                    mod_revision,
                    ..Default::default()
                }],
                count: 1,
            })],
            ..Default::default()
        }
    }

    fn instance() -> StoreInfo {
        StoreInfo::new("/sn/instance/i1", "payload")
    }

    fn route() -> StoreInfo {
        StoreInfo::new("/yr/route/i1", "10.0.0.1")
    }

    #[tokio::test]
    async fn create_builds_the_expected_transaction() {
        let store = ScriptedStore::with(vec![success(2, 11)]);
        let operator = InstanceOperator::new(store.clone());
        let result = operator
            .create(&instance(), Some(&route()), false)
            .await
            .unwrap();
        assert_eq!(result.revision, 11);

        let committed = store.committed.lock();
        let request = &committed[0];
        assert_eq!(request.compare.len(), 2);
        assert_eq!(request.success.len(), 2);
        assert_eq!(request.failure.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_counts_as_success() {
        let store = ScriptedStore::with(vec![failed_with_get(b"payload", 1, 9)]);
        let operator = InstanceOperator::new(store);
        let result = operator.create(&instance(), None, false).await.unwrap();
        // reported like a fresh create: no value or version, just the revision
        assert_eq!(result.revision, 9);
        assert!(result.value.is_empty());
        assert_eq!(result.version, 0);
    }

    #[tokio::test]
    async fn duplicate_modify_reports_the_stored_record() {
        let store = ScriptedStore::with(vec![failed_with_get(b"payload", 3, 9)]);
        let operator = InstanceOperator::new(store);
        let result = operator
            .modify(&instance(), None, 2, false)
            .await
            .unwrap();
        assert_eq!(result.revision, 9);
        assert_eq!(result.value, b"payload");
        assert_eq!(result.version, 2);
    }

    #[tokio::test]
    async fn conflicting_create_reports_wrong_version() {
        let store = ScriptedStore::with(vec![failed_with_get(b"other", 4, 21)]);
        let operator = InstanceOperator::new(store);
        let err = operator.create(&instance(), None, false).await.unwrap_err();
        match err {
            OperatorError::WrongVersion {
                value,
                mod_revision,
            } => {
                assert_eq!(value, b"other");
                assert_eq!(mod_revision, 21);
            }
            other => panic!("expected WrongVersion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_response_size_is_unrecoverable() {
        let store = ScriptedStore::with(vec![success(1, 11)]);
        let operator = InstanceOperator::new(store);
        let err = operator
            .create(&instance(), Some(&route()), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OperatorError::WrongResponseSize {
                expected: 2,
                got: 1
            }
        ));
    }

    #[tokio::test]
    async fn delete_requires_affected_keys() {
        let empty_delete = TxnResponse {
            success: true,
            responses: vec![TxnOpResponse::Delete(DeleteResponse::default())],
            ..Default::default()
        };
        let store = ScriptedStore::with(vec![empty_delete]);
        let operator = InstanceOperator::new(store);
        let err = operator.delete("/sn/instance/i1", None, None, 1).await.unwrap_err();
        assert!(matches!(err, OperatorError::DeleteFailed));
    }

    #[tokio::test]
    async fn delete_deletes_route_and_debug_records() {
        let full_delete = TxnResponse {
            header: ResponseHeader {
                revision: 30,
                ..Default::default()
            },
            success: true,
            responses: vec![
                TxnOpResponse::Delete(DeleteResponse {
                    deleted: 1,
                    ..Default::default()
                }),
                TxnOpResponse::Delete(DeleteResponse {
                    deleted: 1,
                    ..Default::default()
                }),
                TxnOpResponse::Delete(DeleteResponse {
                    deleted: 1,
                    ..Default::default()
                }),
            ],
        };
        let store = ScriptedStore::with(vec![full_delete]);
        let operator = InstanceOperator::new(store.clone());
        let result = operator
            .delete("/sn/instance/i1", Some("/yr/route/i1"), Some("/yr/debug/i1"), 2)
            .await
            .unwrap();
        assert_eq!(result.revision, 30);

        let committed = store.committed.lock();
        assert_eq!(committed[0].success.len(), 3);
    }

    #[tokio::test]
    async fn force_delete_deletes_in_both_branches() {
        let store = ScriptedStore::with(vec![TxnResponse {
            success: false,
            responses: vec![
                TxnOpResponse::Delete(DeleteResponse::default()),
                TxnOpResponse::Delete(DeleteResponse::default()),
            ],
            ..Default::default()
        }]);
        let operator = InstanceOperator::new(store.clone());
        operator
            .force_delete("/sn/instance/i1", Some("/yr/route/i1"), None)
            .await
            .unwrap();

        let committed = store.committed.lock();
        assert_eq!(committed[0].success.len(), 2);
        assert_eq!(committed[0].failure.len(), 2);
    }

    #[tokio::test]
    async fn get_returns_value_and_revision() {
        let store: Arc<ScriptedStore> = ScriptedStore::with(vec![]);
        let operator = InstanceOperator::new(store);
        let result = operator.get("/sn/instance/i1").await.unwrap();
        assert_eq!(result.value, b"stored");
        // a plain read carries no version
        assert_eq!(result.version, 0);
        assert_eq!(result.revision, 17);
    }
}
