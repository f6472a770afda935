//! The RPC channel to one backend.
//!
//! Wraps a tonic channel with the connectivity bookkeeping the strategies
//! rely on: a cheap `is_connected` flag, a bounded initial probe, and the
//! reconnect-wait loop that only declares the transport healthy after three
//! consecutive successful probes.
//!
//! The backend address may resolve to several endpoints (comma-separated);
//! requests are then balanced round-robin across them and probes rotate
//! through the list, counting any reachable endpoint as ready.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::config::TlsOptions;
use crate::error::Error;
use crate::tls;

/// Seconds between reconnect probes.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Budget for a single connection probe.
const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Consecutive successful probes required to declare the channel healthy.
const MAX_READY_COUNT: u32 = 3;
/// Fixed budget for a balanced channel to settle on a reachable endpoint.
pub(crate) const BALANCE_FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RpcChannel {
    address: String,
    endpoints: Arc<Vec<Endpoint>>,
    channel: Channel,
    connected: Arc<AtomicBool>,
    next_probe: Arc<AtomicUsize>,
}

impl RpcChannel {
    /// Set up a channel to `address`, a `host:port` or a comma-separated
    /// list of them. A single endpoint connects lazily; several are
    /// balanced round-robin. Callers that need an up-front liveness
    /// guarantee follow with [`RpcChannel::wait_for_connected`].
    pub fn new(address: &str, tls_options: Option<&TlsOptions>) -> Result<Self, Error> {
        let scheme = if tls_options.is_some() { "https" } else { "http" };
        let mut endpoints = Vec::new();
        for host in address.split(',').map(str::trim).filter(|host| !host.is_empty()) {
            let uri = format!("{scheme}://{host}");
            let mut endpoint = Endpoint::from_shared(uri)
                .map_err(|err| Error::InvalidParameter(format!("bad address {host}: {err}")))?
                .connect_timeout(CONNECT_PROBE_TIMEOUT)
                .tcp_keepalive(Some(Duration::from_secs(30)));
            if let Some(options) = tls_options {
                endpoint = endpoint
                    .tls_config(tls::client_tls_config(options)?)
                    .map_err(|err| Error::InvalidParameter(format!("bad TLS config: {err}")))?;
            }
            endpoints.push(endpoint);
        }
        if endpoints.is_empty() {
            return Err(Error::InvalidParameter(format!(
                "no usable endpoint in address {address:?}"
            )));
        }
        let channel = if endpoints.len() == 1 {
            endpoints[0].connect_lazy()
        } else {
            // requests rotate across every resolved address
            Channel::balance_list(endpoints.clone().into_iter())
        };
        Ok(Self {
            address: address.to_string(),
            endpoints: Arc::new(endpoints),
            channel,
            connected: Arc::new(AtomicBool::new(false)),
            next_probe: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether requests are balanced over more than one endpoint.
    pub fn is_balanced(&self) -> bool {
        self.endpoints.len() > 1
    }

    /// The shared transport handle; clones are cheap and multiplex the same
    /// HTTP/2 connection (or the same balanced set).
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// One bounded connection attempt; a fresh handshake, independent of
    /// the shared channel. Endpoints are tried in rotation and any
    /// reachable one counts.
    async fn probe(&self) -> bool {
        let len = self.endpoints.len();
        let start = self.next_probe.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let endpoint = &self.endpoints[(start + offset) % len];
            if matches!(
                timeout(CONNECT_PROBE_TIMEOUT, endpoint.connect()).await,
                Ok(Ok(_))
            ) {
                return true;
            }
        }
        false
    }

    /// Probe until the transport answers or `deadline` elapses.
    pub async fn wait_for_connected(&self, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        loop {
            if self.probe().await {
                self.mark_connected();
                return true;
            }
            if Instant::now() >= until {
                self.mark_disconnected();
                return false;
            }
            sleep(CONNECT_PROBE_TIMEOUT).await;
        }
    }

    /// Block until the transport has been observed ready [`MAX_READY_COUNT`]
    /// times in a row, sleeping [`RECONNECT_INTERVAL`] between probes.
    ///
    /// Exits early (returning `false`) as soon as `running` flips off.
    pub async fn check_and_wait_for_reconnect(&self, running: &AtomicBool) -> bool {
        self.mark_disconnected();
        let mut ready_count = 0;
        info!(address = %self.address, "waiting for transport to reconnect");
        while running.load(Ordering::Acquire) {
            sleep(RECONNECT_INTERVAL).await;
            if !running.load(Ordering::Acquire) {
                break;
            }
            if self.probe().await {
                ready_count += 1;
                debug!(address = %self.address, ready_count, "transport probe succeeded");
                if ready_count >= MAX_READY_COUNT {
                    self.mark_connected();
                    info!(address = %self.address, "transport reconnected");
                    return true;
                }
            } else {
                if ready_count > 0 {
                    warn!(address = %self.address, "transport probe failed, resetting ready count");
                }
                ready_count = 0;
            }
        }
        false
    }
}

impl std::fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcChannel")
            .field("address", &self.address)
            .field("endpoints", &self.endpoints.len())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_addresses_into_balanced_endpoints() {
        let single = RpcChannel::new("127.0.0.1:2379", None).unwrap();
        assert!(!single.is_balanced());

        let balanced =
            RpcChannel::new("127.0.0.1:2379, 127.0.0.1:2380,127.0.0.1:2381", None).unwrap();
        assert!(balanced.is_balanced());
        assert_eq!(balanced.endpoints.len(), 3);
        assert!(!balanced.is_connected());
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        assert!(matches!(
            RpcChannel::new(" , ", None),
            Err(Error::InvalidParameter(_))
        ));
    }
}
