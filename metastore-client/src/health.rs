//! The fall-break signal shared between the health monitor and the
//! strategies.

use std::sync::Arc;

use parking_lot::RwLock;

/// The monitor's verdict about one backend address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    /// The backend crossed the tolerated failure threshold; carries the
    /// probe error that tripped it.
    Unhealthy(String),
}

/// Receives monitor verdicts. Implemented by the strategies' gates and by
/// anything else that wants fall-break notifications.
pub trait HealthObserver: Send + Sync {
    fn on_healthy_status(&self, status: HealthStatus);
}

/// Cheap local flag consulted at the top of every request path. While the
/// monitor has declared the backend unhealthy, new requests fail immediately
/// with a fall-break error instead of reaching the transport.
#[derive(Clone, Default)]
pub struct HealthGate {
    unhealthy: Arc<RwLock<Option<String>>>,
}

impl HealthGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Some(detail)` while fall-broken.
    pub fn tripped(&self) -> Option<String> {
        self.unhealthy.read().clone()
    }
}

impl HealthObserver for HealthGate {
    fn on_healthy_status(&self, status: HealthStatus) {
        let mut guard = self.unhealthy.write();
        match status {
            HealthStatus::Ok => *guard = None,
            HealthStatus::Unhealthy(detail) => *guard = Some(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_trips_and_recovers() {
        let gate = HealthGate::new();
        assert_eq!(gate.tripped(), None);
        gate.on_healthy_status(HealthStatus::Unhealthy("probe timed out".into()));
        assert_eq!(gate.tripped(), Some("probe timed out".into()));
        gate.on_healthy_status(HealthStatus::Ok);
        assert_eq!(gate.tripped(), None);
    }
}
