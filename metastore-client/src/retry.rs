//! In-flight request tracking with bounded-random re-sends.
//!
//! Every proxied operation is tagged with a fresh UUID and parked here until
//! the correlated reply arrives or the attempt limit is reached. One generic
//! tracker per reply type replaces the per-type helpers a macro would stamp
//! out.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::backoff;
use crate::bus::{BusAddress, MessageBus};
use crate::config::TimeoutOptions;
use crate::error::{Error, Result};

struct InFlight<T> {
    waiter: oneshot::Sender<Result<T>>,
    resender: JoinHandle<()>,
}

/// Correlates requests and replies by UUID and re-sends on a randomized
/// bounded schedule until a reply lands or attempts run out.
pub struct RequestTracker<T> {
    bus: Arc<dyn MessageBus>,
    reply_to: BusAddress,
    options: TimeoutOptions,
    in_flight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
}

impl<T: Send + 'static> RequestTracker<T> {
    pub fn new(bus: Arc<dyn MessageBus>, reply_to: BusAddress, options: TimeoutOptions) -> Self {
        Self {
            bus,
            reply_to,
            options,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send `payload` to `target` under `method` and wait for the correlated
    /// reply. The payload is re-sent at `backoff(attempt)` intervals; when
    /// the attempt count reaches the configured limit the waiter fails with
    /// a timeout.
    pub fn begin(
        &self,
        request_id: String,
        target: BusAddress,
        method: &str,
        payload: Bytes,
    ) -> impl std::future::Future<Output = Result<T>> + Send + 'static {
        let (waiter_tx, waiter_rx) = oneshot::channel();

        // The entry must be visible before the first send so a reply that
        // races the insertion still finds its waiter.
        let resender = tokio::spawn(Self::resend_loop(
            self.bus.clone(),
            self.in_flight.clone(),
            self.reply_to.clone(),
            target.clone(),
            method.to_string(),
            payload.clone(),
            request_id.clone(),
            self.options,
        ));
        self.in_flight.lock().insert(
            request_id.clone(),
            InFlight {
                waiter: waiter_tx,
                resender,
            },
        );

        if let Err(err) = self.bus.send(&self.reply_to, &target, method, payload) {
            warn!(%request_id, %target, method, "failed to send request: {err}");
            self.end(&request_id, Err(err));
        }

        async move {
            waiter_rx
                .await
                .unwrap_or_else(|_| Err(Error::Shutdown("request tracker dropped".into())))
        }
    }

    /// Complete the waiter for `request_id`. Replies with no matching entry
    /// (duplicates, or arrivals after the timeout) are dropped silently.
    pub fn end(&self, request_id: &str, value: Result<T>) {
        let entry = self.in_flight.lock().remove(request_id);
        match entry {
            Some(entry) => {
                entry.resender.abort();
                let _ = entry.waiter.send(value);
            }
            None => debug!(%request_id, "dropping reply with no in-flight entry"),
        }
    }

    /// Number of requests still awaiting replies.
    pub fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn resend_loop(
        bus: Arc<dyn MessageBus>,
        in_flight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
        reply_to: BusAddress,
        target: BusAddress,
        method: String,
        payload: Bytes,
        request_id: String,
        options: TimeoutOptions,
    ) {
        let mut attempt = 1u32;
        loop {
            sleep(backoff::tracker_delay(&options, attempt)).await;
            attempt += 1;
            if attempt >= options.operation_retry_times {
                if let Some(entry) = in_flight.lock().remove(&request_id) {
                    error!(%request_id, %target, %method, attempt, "request ran out of attempts");
                    let _ = entry
                        .waiter
                        .send(Err(Error::Timeout(format!("{method} to {target} timed out"))));
                }
                return;
            }
            if !in_flight.lock().contains_key(&request_id) {
                return;
            }
            warn!(%request_id, %target, %method, attempt, "re-sending request");
            if let Err(err) = bus.send(&reply_to, &target, &method, payload.clone()) {
                warn!(%request_id, %target, %method, "re-send failed: {err}");
            }
        }
    }
}

impl<T> Drop for RequestTracker<T> {
    fn drop(&mut self) {
        for (_, entry) in self.in_flight.lock().drain() {
            entry.resender.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, MemoryBus};
    use tokio::sync::mpsc;

    fn tracker(bus: Arc<MemoryBus>) -> (RequestTracker<u32>, mpsc::UnboundedReceiver<BusMessage>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        bus.register("Peer", peer_tx);
        let options = TimeoutOptions {
            operation_retry_times: 3,
            ..Default::default()
        };
        (
            RequestTracker::new(bus, BusAddress::new("client", "local"), options),
            peer_rx,
        )
    }

    fn peer() -> BusAddress {
        BusAddress::new("Peer", "remote")
    }

    #[tokio::test]
    async fn reply_completes_the_waiter() {
        let bus = MemoryBus::new();
        let (tracker, mut peer_rx) = tracker(bus);
        let fut = tracker.begin("id-1".into(), peer(), "Put", Bytes::from_static(b"x"));
        assert_eq!(peer_rx.recv().await.unwrap().method, "Put");

        tracker.end("id-1", Ok(7));
        assert_eq!(fut.await.unwrap(), 7);
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn duplicate_replies_are_dropped() {
        let bus = MemoryBus::new();
        let (tracker, _peer_rx) = tracker(bus);
        let fut = tracker.begin("id-1".into(), peer(), "Put", Bytes::from_static(b"x"));
        tracker.end("id-1", Ok(1));
        tracker.end("id-1", Ok(2));
        assert_eq!(fut.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resends_then_times_out() {
        let bus = MemoryBus::new();
        let (tracker, mut peer_rx) = tracker(bus);
        let fut = tracker.begin("id-1".into(), peer(), "Get", Bytes::from_static(b"x"));

        // initial send plus one re-send before the attempt limit trips
        assert!(peer_rx.recv().await.is_some());
        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        assert!(peer_rx.recv().await.is_some());
        tokio::time::advance(std::time::Duration::from_secs(16)).await;

        match fut.await {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(tracker.pending(), 0);
    }

    #[tokio::test]
    async fn unroutable_target_fails_fast() {
        let bus = MemoryBus::new();
        let options = TimeoutOptions::default();
        let tracker: RequestTracker<u32> =
            RequestTracker::new(bus, BusAddress::new("client", "local"), options);
        let err = tracker
            .begin(
                "id-1".into(),
                BusAddress::new("Nowhere", "remote"),
                "Put",
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
