//! The actor-bus contract used in proxy mode.
//!
//! The real bus runtime lives outside this crate; strategies only depend on
//! this trait, which captures the contract: fire-and-forget delivery of
//! method-tagged byte payloads between named endpoints, with replies routed
//! back to the sender's registered inbox. [`MemoryBus`] is an in-process
//! implementation used by the test suites.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Error;

/// A logical endpoint on the bus: an actor name plus the node it lives on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BusAddress {
    pub name: String,
    pub node: String,
}

impl BusAddress {
    pub fn new(name: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.node)
    }
}

/// One delivered message.
#[derive(Clone, Debug)]
pub struct BusMessage {
    pub from: BusAddress,
    pub method: String,
    pub payload: Bytes,
}

/// Peer liveness notifications for endpoints that linked to a remote actor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected { node: String },
    Disconnected { node: String },
}

/// Message transport between local strategies and the peer service.
pub trait MessageBus: Send + Sync + 'static {
    /// Deliver `payload` to `target` under `method`, with `from` as the
    /// reply address. Delivery is asynchronous; failure here means the
    /// target is not even routable.
    fn send(
        &self,
        from: &BusAddress,
        target: &BusAddress,
        method: &str,
        payload: Bytes,
    ) -> Result<(), Error>;

    /// Route messages addressed to `name` on this node into `inbox`.
    fn register(&self, name: &str, inbox: mpsc::UnboundedSender<BusMessage>);

    fn unregister(&self, name: &str);

    /// Subscribe to peer liveness transitions. Buses without link tracking
    /// may ignore this.
    fn subscribe_peer_events(&self, _inbox: mpsc::UnboundedSender<PeerEvent>) {}
}

/// An in-process bus: every registered endpoint is local and messages are
/// delivered directly to its inbox.
#[derive(Default)]
pub struct MemoryBus {
    endpoints: Mutex<HashMap<String, mpsc::UnboundedSender<BusMessage>>>,
    peer_subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerEvent>>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Emit a peer liveness event to every subscriber.
    pub fn emit_peer_event(&self, event: PeerEvent) {
        self.peer_subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl MessageBus for MemoryBus {
    fn send(
        &self,
        from: &BusAddress,
        target: &BusAddress,
        method: &str,
        payload: Bytes,
    ) -> Result<(), Error> {
        let endpoints = self.endpoints.lock();
        let inbox = endpoints
            .get(&target.name)
            .ok_or_else(|| Error::Unavailable(format!("no endpoint registered for {target}")))?;
        inbox
            .send(BusMessage {
                from: from.clone(),
                method: method.to_string(),
                payload,
            })
            .map_err(|_| Error::Unavailable(format!("endpoint {target} is gone")))
    }

    fn register(&self, name: &str, inbox: mpsc::UnboundedSender<BusMessage>) {
        self.endpoints.lock().insert(name.to_string(), inbox);
    }

    fn unregister(&self, name: &str) {
        self.endpoints.lock().remove(name);
    }

    fn subscribe_peer_events(&self, inbox: mpsc::UnboundedSender<PeerEvent>) {
        self.peer_subscribers.lock().push(inbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_endpoint_name() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.register("KvService", tx);

        let from = BusAddress::new("client", "local");
        let target = BusAddress::new("KvService", "peer-1");
        bus.send(&from, &target, "Put", Bytes::from_static(b"payload"))
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.method, "Put");
        assert_eq!(message.from, from);

        bus.unregister("KvService");
        assert!(bus
            .send(&from, &target, "Put", Bytes::from_static(b"payload"))
            .is_err());
    }
}
