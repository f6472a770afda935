//! Option structs accepted by the client surface.

use crate::proto::rpc::{self, range_request};

/// Sort order for range queries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    None,
    Ascend,
    Descend,
}

impl From<SortOrder> for range_request::SortOrder {
    fn from(order: SortOrder) -> Self {
        match order {
            SortOrder::None => range_request::SortOrder::None,
            SortOrder::Ascend => range_request::SortOrder::Ascend,
            SortOrder::Descend => range_request::SortOrder::Descend,
        }
    }
}

/// Which key-value field a range query sorts on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortTarget {
    #[default]
    Key,
    Version,
    Create,
    Mod,
    Value,
}

impl From<SortTarget> for range_request::SortTarget {
    fn from(target: SortTarget) -> Self {
        match target {
            SortTarget::Key => range_request::SortTarget::Key,
            SortTarget::Version => range_request::SortTarget::Version,
            SortTarget::Create => range_request::SortTarget::Create,
            SortTarget::Mod => range_request::SortTarget::Mod,
            SortTarget::Value => range_request::SortTarget::Value,
        }
    }
}

/// Options for a put.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutOptions {
    /// Lease to attach the key to. Zero means no lease.
    pub lease_id: i64,
    /// Return the overwritten key-value in the response.
    pub prev_kv: bool,
    /// Replication policy flag, opaque to the client and propagated to the
    /// backend with the request.
    pub async_backup: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            lease_id: 0,
            prev_kv: false,
            async_backup: true,
        }
    }
}

impl PutOptions {
    #[must_use]
    pub fn with_lease(mut self, lease_id: i64) -> Self {
        self.lease_id = lease_id;
        self
    }

    #[must_use]
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Options for a delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Return the deleted key-values in the response.
    pub prev_kv: bool,
    /// Delete every key with the given prefix.
    pub prefix: bool,
    pub async_backup: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            prev_kv: false,
            prefix: false,
            async_backup: true,
        }
    }
}

impl DeleteOptions {
    #[must_use]
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    #[must_use]
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Options for a get.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Match every key with the given prefix.
    pub prefix: bool,
    /// Return keys without values.
    pub keys_only: bool,
    /// Only return the number of matching keys.
    pub count_only: bool,
    /// Limit the number of keys returned. Zero means no limit.
    pub limit: i64,
    pub sort_order: SortOrder,
    pub sort_target: SortTarget,
}

impl GetOptions {
    #[must_use]
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn with_sort(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort_target = target;
        self.sort_order = order;
        self
    }

    /// Encode into a `RangeRequest` for `key` already carrying the table
    /// prefix. `range_end` is filled in by the caller for prefix queries.
    pub fn build_range(&self, key: Vec<u8>, range_end: Vec<u8>) -> rpc::RangeRequest {
        rpc::RangeRequest {
            key,
            range_end,
            limit: self.limit,
            keys_only: self.keys_only,
            count_only: self.count_only,
            sort_order: range_request::SortOrder::from(self.sort_order) as i32,
            sort_target: range_request::SortTarget::from(self.sort_target) as i32,
            ..Default::default()
        }
    }
}

/// Options for a watch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Watch every key with the given prefix.
    pub prefix: bool,
    /// Deliver the previous key-value with each event.
    pub prev_kv: bool,
    /// Revision to start watching from (inclusive). Zero means "now"; the
    /// strategy advances this after every delivered batch so the watch can
    /// be resumed.
    pub revision: i64,
    /// Keep retrying the create request until it is written successfully
    /// instead of failing fast while disconnected.
    pub keep_retry: bool,
}

impl WatchOptions {
    #[must_use]
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    #[must_use]
    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    #[must_use]
    pub fn starting_at(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    #[must_use]
    pub fn with_keep_retry(mut self) -> Self {
        self.keep_retry = true;
        self
    }
}
