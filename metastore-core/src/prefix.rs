//! Table-prefix handling.
//!
//! Every user-supplied key is namespaced with an opaque table prefix on the
//! way out and trimmed on the way back, so callers only ever see their own
//! keys.

/// Prepend the table prefix to a user key.
pub fn prefix_key(prefix: &str, key: &str) -> Vec<u8> {
    if prefix.is_empty() {
        return key.as_bytes().to_vec();
    }
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

/// Strip the table prefix from a returned key. Keys that do not carry the
/// prefix are passed through untouched.
pub fn trim_prefix(prefix: &str, key: &[u8]) -> Vec<u8> {
    if !prefix.is_empty() && key.starts_with(prefix.as_bytes()) {
        key[prefix.len()..].to_vec()
    } else {
        key.to_vec()
    }
}

/// Like [`trim_prefix`] but for keys known to be valid UTF-8 paths.
pub fn trim_prefix_str(prefix: &str, key: &[u8]) -> String {
    String::from_utf8_lossy(&trim_prefix(prefix, key)).into_owned()
}

/// Compute the exclusive upper bound that turns `[key, range_end)` into a
/// prefix scan: the key with its last byte incremented, carrying over 0xff
/// bytes. An empty or all-0xff key watches from key to the end of the
/// keyspace (`[0]` per the etcd convention).
pub fn prefix_range_end(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    while let Some(last) = end.last().copied() {
        if last < 0xff {
            *end.last_mut().unwrap() = last + 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_round_trip() {
        let wire = prefix_key("/cluster-a", "/sn/workers/xxx");
        assert_eq!(wire, b"/cluster-a/sn/workers/xxx");
        assert_eq!(trim_prefix("/cluster-a", &wire), b"/sn/workers/xxx");
    }

    #[test]
    fn empty_prefix_is_identity() {
        assert_eq!(prefix_key("", "/k"), b"/k");
        assert_eq!(trim_prefix("", b"/k"), b"/k");
    }

    #[test]
    fn foreign_keys_are_not_trimmed() {
        assert_eq!(trim_prefix("/cluster-a", b"/other/k"), b"/other/k");
    }

    #[test]
    fn range_end_increments_last_byte() {
        assert_eq!(prefix_range_end(b"/sn/workers/"), b"/sn/workers0");
        assert_eq!(prefix_range_end(b"a\xff"), b"b");
        assert_eq!(prefix_range_end(b"\xff\xff"), vec![0]);
        assert_eq!(prefix_range_end(b""), vec![0]);
    }
}
