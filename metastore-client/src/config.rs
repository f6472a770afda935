//! Client configuration.

use std::time::Duration;

use serde::Deserialize;

/// Which set of strategies the manager instantiates and how keys route
/// between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingMode {
    /// Everything goes straight to the backend.
    Direct,
    /// Everything goes through the peer service.
    ProxyFull,
    /// Keys matching an excluded prefix bypass the peer and go direct.
    ProxyWithExclusions,
}

/// Top-level client configuration.
///
/// Field names follow the option surface of the wider system; everything has
/// a sensible default so partial configs deserialize cleanly.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Direct backend endpoint, `host:port`. A comma-separated list of
    /// endpoints is balanced round-robin.
    pub etcd_address: String,
    /// Peer service address for proxy mode.
    pub meta_store_address: String,
    /// Select proxy vs direct KV/lease/election/maintenance.
    pub enable_meta_store: bool,
    /// In proxy mode, whether election is proxied too.
    pub is_meta_store_passthrough: bool,
    /// Opaque prefix prepended to every user key and trimmed on the way back.
    pub etcd_table_prefix: String,
    /// Key prefixes that bypass the proxy and go direct.
    pub excluded_keys: Vec<String>,
    /// Retry and deadline tuning.
    pub timeouts: TimeoutOptions,
    /// TLS material for the backend and peer channels. Plaintext when absent.
    pub tls: Option<TlsOptions>,
}

impl Config {
    /// A direct-mode config against the given backend.
    pub fn direct(etcd_address: impl Into<String>) -> Self {
        Self {
            etcd_address: etcd_address.into(),
            ..Self::default()
        }
    }

    /// A proxy-mode config against the given peer.
    pub fn proxied(meta_store_address: impl Into<String>) -> Self {
        Self {
            meta_store_address: meta_store_address.into(),
            enable_meta_store: true,
            is_meta_store_passthrough: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.etcd_table_prefix = prefix.into();
        self
    }

    /// The routing mode implied by this configuration.
    pub fn routing_mode(&self) -> RoutingMode {
        if !self.enable_meta_store {
            RoutingMode::Direct
        } else if self.excluded_keys.is_empty() || self.is_meta_store_passthrough {
            RoutingMode::ProxyFull
        } else {
            RoutingMode::ProxyWithExclusions
        }
    }

    /// Whether `key` bypasses the proxy under `ProxyWithExclusions`.
    pub fn is_excluded_key(&self, key: &str) -> bool {
        self.excluded_keys.iter().any(|prefix| key.starts_with(prefix))
    }
}

/// Retry and deadline tuning shared by every strategy.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutOptions {
    /// Uniform-random backoff lower bound in milliseconds.
    pub operation_retry_interval_lower_bound: u64,
    /// Uniform-random backoff upper bound in milliseconds.
    pub operation_retry_interval_upper_bound: u64,
    /// Attempt limit for unary operations.
    pub operation_retry_times: u32,
    /// Per-call deadline in seconds; multiplied by the attempt number.
    pub grpc_timeout: u64,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            operation_retry_interval_lower_bound: 1000,
            operation_retry_interval_upper_bound: 5000,
            operation_retry_times: 5,
            grpc_timeout: 5,
        }
    }
}

impl TimeoutOptions {
    pub fn grpc_timeout(&self) -> Duration {
        Duration::from_secs(self.grpc_timeout)
    }

    /// Deadline for the given 1-based attempt.
    pub fn deadline(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.grpc_timeout * u64::from(attempt))
    }
}

/// PEM material and target-name override for a TLS channel.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsOptions {
    /// Path to the PEM-encoded CA bundle.
    pub ca_cert_path: String,
    /// Path to the PEM-encoded client certificate.
    pub cert_path: String,
    /// Path to the PEM-encoded client private key.
    pub key_path: String,
    /// Expected server name, when it differs from the dialed host.
    pub target_name_override: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_mode_follows_flags() {
        let direct = Config::direct("127.0.0.1:2379");
        assert_eq!(direct.routing_mode(), RoutingMode::Direct);

        let proxied = Config::proxied("127.0.0.1:8890");
        assert_eq!(proxied.routing_mode(), RoutingMode::ProxyFull);

        let mut excluded = Config::proxied("127.0.0.1:8890");
        excluded.is_meta_store_passthrough = false;
        excluded.excluded_keys = vec!["/yr/route".into()];
        assert_eq!(excluded.routing_mode(), RoutingMode::ProxyWithExclusions);
        assert!(excluded.is_excluded_key("/yr/route/abc"));
        assert!(!excluded.is_excluded_key("/sn/instance/abc"));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: Config = serde_json::from_str(
            r#"{
                "etcdAddress": "127.0.0.1:2379",
                "etcdTablePrefix": "/cluster-a",
                "timeouts": {"operationRetryTimes": 3}
            }"#,
        )
        .unwrap();
        assert_eq!(config.etcd_address, "127.0.0.1:2379");
        assert_eq!(config.etcd_table_prefix, "/cluster-a");
        assert_eq!(config.timeouts.operation_retry_times, 3);
        assert_eq!(config.timeouts.grpc_timeout, 5);
    }
}
