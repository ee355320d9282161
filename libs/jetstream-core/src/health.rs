//! Background connection-health monitoring.
//!
//! The monitor probes liveness on a fixed interval, mirrors the result into
//! the availability gauge and forwards it to the injected [`HealthChecker`].
//! It starts pessimistic (unavailable) and the only way out of the loop is
//! cancellation of its token; probe failures never end it.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use prometheus::IntGauge;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External health-reporting collaborator.
///
/// Implementations must not block significantly; they are called from the
/// monitor loop on every probe.
pub trait HealthChecker: Send + Sync + 'static {
    /// Set the status of the named dependency to up (`true`) or down.
    fn set_status(&self, name: &str, up: bool);
}

/// Liveness probe against the broker connection.
#[async_trait]
pub trait LivenessProbe: Send + Sync + 'static {
    async fn is_alive(&self) -> bool;
}

#[async_trait]
impl LivenessProbe for async_nats::Client {
    async fn is_alive(&self) -> bool {
        matches!(
            self.connection_state(),
            async_nats::connection::State::Connected
        )
    }
}

/// Tri-state availability of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No probe has completed yet.
    Unknown,
    Available,
    Unavailable,
}

impl HealthStatus {
    /// Gauge value: 1 when available, 0 otherwise.
    pub fn gauge_value(self) -> i64 {
        match self {
            HealthStatus::Available => 1,
            HealthStatus::Unknown | HealthStatus::Unavailable => 0,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => HealthStatus::Available,
            2 => HealthStatus::Unavailable,
            _ => HealthStatus::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Available => 1,
            HealthStatus::Unavailable => 2,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Available => write!(f, "available"),
            HealthStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Shared, lock-free view of the monitor's last observed status.
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<AtomicU8>);

impl StatusCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(HealthStatus::Unknown.as_u8())))
    }

    pub fn get(&self) -> HealthStatus {
        HealthStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, status: HealthStatus) {
        self.0.store(status.as_u8(), Ordering::Release);
    }
}

/// Periodic liveness monitor. Consumed by [`HealthMonitor::spawn`].
pub struct HealthMonitor<P> {
    probe: P,
    checker: Option<Arc<dyn HealthChecker>>,
    name: String,
    interval: Duration,
    gauge: IntGauge,
    status: StatusCell,
}

impl<P> fmt::Debug for HealthMonitor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

impl<P: LivenessProbe> HealthMonitor<P> {
    /// Create a monitor. The gauge is set to 0 immediately.
    pub fn new(
        probe: P,
        checker: Option<Arc<dyn HealthChecker>>,
        name: impl Into<String>,
        interval: Duration,
        gauge: IntGauge,
    ) -> Self {
        gauge.set(0);
        Self {
            probe,
            checker,
            name: name.into(),
            interval,
            gauge,
            status: StatusCell::new(),
        }
    }

    /// Handle to read the current status from other tasks.
    pub fn status(&self) -> StatusCell {
        self.status.clone()
    }

    /// Run one probe and report its outcome.
    async fn probe_once(&self) -> HealthStatus {
        let status = if self.probe.is_alive().await {
            HealthStatus::Available
        } else {
            HealthStatus::Unavailable
        };
        let previous = self.status.get();
        self.report(status);
        if previous != status {
            match status {
                HealthStatus::Available => info!(name = %self.name, "NATS connection available"),
                _ => warn!(name = %self.name, %previous, "NATS connection unavailable"),
            }
        }
        status
    }

    fn report(&self, status: HealthStatus) {
        self.status.set(status);
        self.gauge.set(status.gauge_value());
        if let Some(checker) = &self.checker {
            checker.set_status(&self.name, status == HealthStatus::Available);
        }
    }

    /// Probe every interval until `token` is cancelled. The first probe runs
    /// immediately.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(name = %self.name, "health monitor stopping");
                    self.report(HealthStatus::Unavailable);
                    // release the checker handle before returning
                    drop(self);
                    return;
                }
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
            }
        }
    }

    /// Run the monitor as an independent background task.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use parking_lot::Mutex;
    use prometheus::{Opts, Registry};
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    use super::*;

    #[derive(Clone)]
    struct FlagProbe(Arc<AtomicBool>);

    #[async_trait]
    impl LivenessProbe for FlagProbe {
        async fn is_alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct ChannelChecker {
        tx: mpsc::UnboundedSender<(String, bool)>,
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl HealthChecker for ChannelChecker {
        fn set_status(&self, name: &str, up: bool) {
            self.calls.lock().push((name.to_owned(), up));
            let _ = self.tx.send((name.to_owned(), up));
        }
    }

    fn gauge() -> IntGauge {
        let gauge = IntGauge::with_opts(Opts::new("test_availability", "test")).unwrap();
        Registry::new().register(Box::new(gauge.clone())).unwrap();
        gauge
    }

    fn checker() -> (Arc<ChannelChecker>, mpsc::UnboundedReceiver<(String, bool)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelChecker {
                tx,
                calls: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(HealthStatus::Available.gauge_value(), 1);
        assert_eq!(HealthStatus::Unavailable.gauge_value(), 0);
        assert_eq!(HealthStatus::Unknown.gauge_value(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gauge_goes_up_then_down_on_cancel() {
        let alive = Arc::new(AtomicBool::new(true));
        let gauge = gauge();
        gauge.set(7);
        let (checker, mut rx) = checker();
        let monitor = HealthMonitor::new(
            FlagProbe(alive),
            Some(checker.clone() as Arc<dyn HealthChecker>),
            "nats",
            Duration::from_secs(10),
            gauge.clone(),
        );
        // pessimistic until the first probe
        assert_eq!(gauge.get(), 0);
        let status = monitor.status();
        assert_eq!(status.get(), HealthStatus::Unknown);

        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        assert_eq!(rx.recv().await, Some(("nats".to_owned(), true)));
        assert_eq!(gauge.get(), 1);
        assert_eq!(status.get(), HealthStatus::Available);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(gauge.get(), 0);
        assert_eq!(status.get(), HealthStatus::Unavailable);
        assert_eq!(checker.calls.lock().last(), Some(&("nats".to_owned(), false)));
        // checker handle released with the monitor
        assert_eq!(Arc::strong_count(&checker), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_probe_failure_does_not_stop_loop() {
        let alive = Arc::new(AtomicBool::new(false));
        let gauge = gauge();
        let (checker, mut rx) = checker();
        let monitor = HealthMonitor::new(
            FlagProbe(alive.clone()),
            Some(checker as Arc<dyn HealthChecker>),
            "orders-nats",
            Duration::from_secs(10),
            gauge.clone(),
        );
        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        assert_eq!(rx.recv().await, Some(("orders-nats".to_owned(), false)));
        assert_eq!(gauge.get(), 0);

        alive.store(true, Ordering::SeqCst);
        // next tick after the interval elapses on the paused clock
        assert_eq!(rx.recv().await, Some(("orders-nats".to_owned(), true)));
        assert_eq!(gauge.get(), 1);
        assert!(!handle.is_finished());
        assert!(logs_contain("NATS connection available"));

        token.cancel();
        handle.await.unwrap();
        assert_eq!(gauge.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_without_checker() {
        let gauge = gauge();
        let monitor = HealthMonitor::new(
            FlagProbe(Arc::new(AtomicBool::new(true))),
            None,
            "nats",
            Duration::from_millis(100),
            gauge.clone(),
        );
        let status = monitor.status();
        let token = CancellationToken::new();
        let handle = monitor.spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(status.get(), HealthStatus::Available);
        assert_eq!(gauge.get(), 1);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(gauge.get(), 0);
    }
}
