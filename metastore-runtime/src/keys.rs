//! Layout of the persisted instance records.
//!
//! An instance is stored under a hierarchical path carrying its tenant,
//! function, version, request and instance ids; its route record lives
//! under a flat path keyed by instance id, and debug instances carry an
//! extra record deleted jointly with the instance.

pub const INSTANCE_PATH_PREFIX: &str = "/sn/instance/business/yrk/tenant";
pub const INSTANCE_ROUTE_PATH_PREFIX: &str = "/yr/route/business/yrk";
pub const DEBUG_INSTANCE_PREFIX: &str = "/yr/debug/";

/// `/sn/instance/.../<requestId>/<instanceId>` splits into this many
/// segments.
const INSTANCE_KEY_SEGMENTS: usize = 14;
/// `/yr/route/business/yrk/<instanceId>` splits into this many segments.
const ROUTE_KEY_SEGMENTS: usize = 6;

/// Ids recovered from an instance or route key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceKeyInfo {
    pub instance_id: String,
    pub request_id: String,
}

/// Build the instance record key from a `tenant/function/version` function
/// key. Returns `None` when the function key is malformed.
pub fn instance_key(function_key: &str, request_id: &str, instance_id: &str) -> Option<String> {
    let parts: Vec<&str> = function_key.split('/').collect();
    if parts.len() != 3 {
        return None;
    }
    Some(format!(
        "{INSTANCE_PATH_PREFIX}/{}/function/{}/version/{}/defaultaz/{request_id}/{instance_id}",
        parts[0], parts[1], parts[2]
    ))
}

pub fn route_key(instance_id: &str) -> String {
    format!("{INSTANCE_ROUTE_PATH_PREFIX}/{instance_id}")
}

pub fn debug_key(instance_id: &str) -> String {
    format!("{DEBUG_INSTANCE_PREFIX}{instance_id}")
}

/// Recover the ids from either an instance key or a route key.
pub fn parse_instance_key(key: &str) -> InstanceKeyInfo {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() == INSTANCE_KEY_SEGMENTS && parts[1] == "sn" && parts[2] == "instance" {
        return InstanceKeyInfo {
            instance_id: parts[13].to_string(),
            request_id: parts[12].to_string(),
        };
    }
    if parts.len() == ROUTE_KEY_SEGMENTS {
        return InstanceKeyInfo {
            instance_id: parts[5].to_string(),
            request_id: String::new(),
        };
    }
    InstanceKeyInfo::default()
}

/// Recover the `tenant/function/version` function key from an instance
/// record key.
pub fn function_key_from_instance_key(key: &str) -> Option<String> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != INSTANCE_KEY_SEGMENTS {
        return None;
    }
    Some(format!("{}/{}/{}", parts[6], parts[8], parts[10]))
}
