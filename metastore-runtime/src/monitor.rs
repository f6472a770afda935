//! Continuous health probing with a fall-breaker.
//!
//! One monitor runs per backend address. Every tick it probes the
//! maintenance strategy with a bounded budget, counts consecutive failures,
//! and once the tolerated threshold is crossed fans an unhealthy verdict
//! out to every registered observer (the strategies' fall-break gates). The
//! next healthy probe publishes recovery. Alarm state escalates from major
//! to critical when a failure burst lasts longer than the escalation
//! window.

use std::sync::Arc;
use std::time::Duration;

use metastore_client::health::{HealthObserver, HealthStatus};
use metastore_client::maintenance::MaintenanceStrategy;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Alarm escalation threshold: a major alarm older than this becomes
/// critical.
const MAX_MAJOR_ALARM: Duration = Duration::from_secs(300);

/// Budget for the initial connectivity confirmation.
const MAX_CONNECT_TIME: Duration = Duration::from_secs(60);

/// Probe cadence and tolerance.
#[derive(Clone, Copy, Debug)]
pub struct MonitorParams {
    /// Consecutive failures tolerated before declaring unhealthy.
    pub max_tolerate_failed_times: u32,
    pub check_interval: Duration,
    /// Budget for a single probe; overruns count as failures.
    pub timeout: Duration,
}

impl Default for MonitorParams {
    fn default() -> Self {
        Self {
            max_tolerate_failed_times: 5,
            check_interval: Duration::from_millis(10_000),
            timeout: Duration::from_millis(8_000),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmLevel {
    Off,
    Major,
    Critical,
}

/// Alarm escalation sink. The process wires a real reporter; tests record.
pub trait AlarmSink: Send + Sync {
    fn firing(&self, level: AlarmLevel, detail: &str);
    fn resolved(&self, level: AlarmLevel);
}

/// Default sink that only logs.
pub struct LogAlarmSink;

impl AlarmSink for LogAlarmSink {
    fn firing(&self, level: AlarmLevel, detail: &str) {
        warn!(?level, detail, "backend unhealthy alarm firing");
    }

    fn resolved(&self, level: AlarmLevel) {
        info!(?level, "backend unhealthy alarm resolved");
    }
}

enum MonitorMsg {
    /// Scheduled tick; stale generations are dropped.
    Tick(u64),
    /// Out-of-band probe request (reconnected callback).
    CheckNow,
    ProbeResult(Result<(), String>),
    Register(Arc<dyn HealthObserver>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running monitor actor.
pub struct HealthMonitor {
    tx: mpsc::UnboundedSender<MonitorMsg>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Spawn the monitor actor and schedule its first tick. The strategy's
    /// reconnected callback is bound to an immediate out-of-band check.
    pub fn start(
        address: &str,
        params: MonitorParams,
        client: Arc<dyn MaintenanceStrategy>,
        sink: Arc<dyn AlarmSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let tx = tx.clone();
            client.bind_reconnected_callback(Arc::new(move |_address| {
                let _ = tx.send(MonitorMsg::CheckNow);
            }));
        }
        let actor = MonitorActor {
            address: address.to_string(),
            params,
            client,
            sink,
            tx: tx.clone(),
            observers: Vec::new(),
            failed_times: 0,
            alarm_level: AlarmLevel::Off,
            firing_since: None,
            checking: false,
            generation: 0,
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Confirm the backend is reachable within a bounded budget before the
    /// periodic probing carries on.
    pub async fn check_connected(&self, client: &Arc<dyn MaintenanceStrategy>) -> bool {
        let connected = timeout(MAX_CONNECT_TIME, client.is_connected())
            .await
            .unwrap_or(false);
        if !connected {
            error!("failed to confirm backend connectivity");
        }
        connected
    }

    pub fn register_observer(&self, observer: Arc<dyn HealthObserver>) {
        let _ = self.tx.send(MonitorMsg::Register(observer));
    }

    /// Request an immediate probe outside the normal cadence.
    pub fn check_now(&self) {
        let _ = self.tx.send(MonitorMsg::CheckNow);
    }

    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(MonitorMsg::Shutdown(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
        if let Some(task) = self.task.lock().take() {
            let _ = task.await;
        }
    }
}

struct MonitorActor {
    address: String,
    params: MonitorParams,
    client: Arc<dyn MaintenanceStrategy>,
    sink: Arc<dyn AlarmSink>,
    tx: mpsc::UnboundedSender<MonitorMsg>,
    observers: Vec<Arc<dyn HealthObserver>>,
    failed_times: u32,
    alarm_level: AlarmLevel,
    firing_since: Option<Instant>,
    checking: bool,
    generation: u64,
}

impl MonitorActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MonitorMsg>) {
        self.schedule_tick();
        while let Some(msg) = rx.recv().await {
            match msg {
                MonitorMsg::Tick(generation) => {
                    if generation == self.generation {
                        self.probe();
                    }
                }
                MonitorMsg::CheckNow => self.probe(),
                MonitorMsg::ProbeResult(result) => self.on_probe_result(result),
                MonitorMsg::Register(observer) => self.observers.push(observer),
                MonitorMsg::Shutdown(reply) => {
                    let _ = reply.send(());
                    return;
                }
            }
        }
    }

    fn schedule_tick(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let interval = self.params.check_interval;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(interval).await;
            let _ = tx.send(MonitorMsg::Tick(generation));
        });
    }

    fn probe(&mut self) {
        if self.checking {
            return;
        }
        self.checking = true;
        let client = self.client.clone();
        let budget = self.params.timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match timeout(budget, client.health_check()).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("health check timed out".to_string()),
            };
            let _ = tx.send(MonitorMsg::ProbeResult(result));
        });
    }

    fn on_probe_result(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => self.on_healthy(),
            Err(detail) => self.on_unhealthy(detail),
        }
        self.checking = false;
        self.schedule_tick();
    }

    fn on_healthy(&mut self) {
        debug!(address = %self.address, "health probe succeeded");
        match self.alarm_level {
            AlarmLevel::Major => self.sink.resolved(AlarmLevel::Major),
            AlarmLevel::Critical => {
                self.sink.resolved(AlarmLevel::Major);
                self.sink.resolved(AlarmLevel::Critical);
            }
            AlarmLevel::Off => {}
        }
        self.alarm_level = AlarmLevel::Off;
        self.firing_since = None;

        // the fall-break was published; publish the recovery exactly once
        if self.failed_times >= self.params.max_tolerate_failed_times {
            info!(
                address = %self.address,
                observers = self.observers.len(),
                "backend recovered, notifying observers"
            );
            for observer in &self.observers {
                observer.on_healthy_status(HealthStatus::Ok);
            }
        }
        self.failed_times = 0;
    }

    fn on_unhealthy(&mut self, detail: String) {
        debug!(address = %self.address, %detail, "health probe failed");
        self.failed_times += 1;
        let threshold = self.params.max_tolerate_failed_times;
        if threshold != 0 && self.failed_times >= threshold && self.failed_times % threshold == 0 {
            warn!(
                address = %self.address,
                failed_times = self.failed_times,
                "failure threshold crossed, notifying observers to fall-break"
            );
            for observer in &self.observers {
                observer.on_healthy_status(HealthStatus::Unhealthy(detail.clone()));
            }
        }

        let now = Instant::now();
        match self.alarm_level {
            AlarmLevel::Off => {
                self.firing_since = Some(now);
                self.alarm_level = AlarmLevel::Major;
                self.sink.firing(AlarmLevel::Major, &detail);
            }
            AlarmLevel::Major => {
                if self
                    .firing_since
                    .is_some_and(|since| now.duration_since(since) > MAX_MAJOR_ALARM)
                {
                    self.alarm_level = AlarmLevel::Critical;
                }
                self.sink.firing(self.alarm_level, &detail);
            }
            AlarmLevel::Critical => self.sink.firing(AlarmLevel::Critical, &detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use metastore_client::maintenance::ReconnectedCallback;
    use metastore_core::StatusResponse;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;

    struct ScriptedMaintenance {
        script: PlMutex<VecDeque<Result<(), String>>>,
        callback: PlMutex<Option<ReconnectedCallback>>,
    }

    impl ScriptedMaintenance {
        fn new(script: Vec<Result<(), String>>) -> Arc<Self> {
            Arc::new(Self {
                script: PlMutex::new(script.into()),
                callback: PlMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl MaintenanceStrategy for ScriptedMaintenance {
        async fn health_check(&self) -> metastore_client::Result<StatusResponse> {
            match self.script.lock().pop_front() {
                Some(Ok(())) | None => Ok(StatusResponse::default()),
                Some(Err(detail)) => Err(metastore_client::Error::Unavailable(detail)),
            }
        }

        async fn is_connected(&self) -> bool {
            true
        }

        fn bind_reconnected_callback(&self, callback: ReconnectedCallback) {
            *self.callback.lock() = Some(callback);
        }

        async fn shutdown(&self) {}
    }

    #[derive(Default)]
    struct RecordingObserver {
        statuses: PlMutex<Vec<HealthStatus>>,
    }

    impl HealthObserver for RecordingObserver {
        fn on_healthy_status(&self, status: HealthStatus) {
            self.statuses.lock().push(status);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: PlMutex<Vec<(AlarmLevel, bool)>>,
    }

    impl AlarmSink for RecordingSink {
        fn firing(&self, level: AlarmLevel, _detail: &str) {
            self.events.lock().push((level, true));
        }

        fn resolved(&self, level: AlarmLevel) {
            self.events.lock().push((level, false));
        }
    }

    async fn run_ticks(params: &MonitorParams, ticks: u32) {
        for _ in 0..ticks {
            // let the pending tick timer register before advancing the clock
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            tokio::time::advance(params.check_interval + Duration::from_millis(10)).await;
            // let the probe task and the result message drain
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_fires_once_and_refires_on_multiples() {
        // scripted: 5 failures, then 5 more, then recovery
        let params = MonitorParams {
            max_tolerate_failed_times: 5,
            check_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
        };
        let mut script = vec![Err("down".to_string()); 10];
        script.push(Ok(()));
        let maintenance = ScriptedMaintenance::new(script);
        let sink = Arc::new(RecordingSink::default());
        let monitor = HealthMonitor::start(
            "127.0.0.1:2379",
            params,
            maintenance.clone() as Arc<dyn MaintenanceStrategy>,
            sink.clone(),
        );
        let observer = Arc::new(RecordingObserver::default());
        monitor.register_observer(observer.clone());

        run_ticks(&params, 11).await;

        let statuses = observer.statuses.lock().clone();
        // unhealthy at the 5th and 10th failure, recovery on the next OK
        assert_eq!(statuses.len(), 3);
        assert!(matches!(statuses[0], HealthStatus::Unhealthy(_)));
        assert!(matches!(statuses[1], HealthStatus::Unhealthy(_)));
        assert_eq!(statuses[2], HealthStatus::Ok);

        // alarm went major on the first failure and resolved at the end
        let events = sink.events.lock().clone();
        assert_eq!(events.first(), Some(&(AlarmLevel::Major, true)));
        assert_eq!(events.last(), Some(&(AlarmLevel::Major, false)));

        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probes_do_not_notify() {
        let params = MonitorParams {
            max_tolerate_failed_times: 3,
            check_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
        };
        let maintenance = ScriptedMaintenance::new(vec![Ok(()), Ok(()), Ok(())]);
        let monitor = HealthMonitor::start(
            "127.0.0.1:2379",
            params,
            maintenance.clone() as Arc<dyn MaintenanceStrategy>,
            Arc::new(RecordingSink::default()),
        );
        let observer = Arc::new(RecordingObserver::default());
        monitor.register_observer(observer.clone());

        run_ticks(&params, 3).await;

        assert!(observer.statuses.lock().is_empty());
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_below_threshold_stay_quiet() {
        let params = MonitorParams {
            max_tolerate_failed_times: 5,
            check_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
        };
        let maintenance =
            ScriptedMaintenance::new(vec![Err("down".into()), Err("down".into()), Ok(())]);
        let monitor = HealthMonitor::start(
            "127.0.0.1:2379",
            params,
            maintenance.clone() as Arc<dyn MaintenanceStrategy>,
            Arc::new(RecordingSink::default()),
        );
        let observer = Arc::new(RecordingObserver::default());
        monitor.register_observer(observer.clone());

        run_ticks(&params, 3).await;

        assert!(observer.statuses.lock().is_empty());
        monitor.shutdown().await;
    }
}
