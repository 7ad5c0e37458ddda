//! Backend liveness probing and forced restarts
//!
//! Three entry points share one probe primitive:
//!
//! - [`HealthMonitor::await_startup`] polls a freshly started backend until it
//!   answers, exits, or runs out of startup time.
//! - [`HealthMonitor::run`] probes periodically once the backend has been
//!   ready and restarts it after too many consecutive failures.
//! - [`HealthMonitor::on_forward_failure`] is the reactive check the forwarder
//!   triggers when a request exhausted its retries.
//!
//! All restarts funnel through [`HealthMonitor::force_restart`], which lets at
//! most one restart run at a time and abandons it once shutdown is signalled.

use crate::config::HealthConfig;
use crate::lock::LockManager;
use crate::pool::ConnectionPool;
use crate::process::{BackendControl, BackendState, Supervisor, SupervisorError};
use crate::readiness::Readiness;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How the startup watch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready,
    /// The process is gone (exited or never spawned)
    Exited,
    TimedOut,
}

/// What a reactive check decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactiveOutcome {
    /// A forward succeeded recently enough that the failure is not trusted
    Fresh,
    /// Another restart is already running
    RestartInProgress,
    /// The probe got an answer; the backend stays
    Healthy,
    /// The probe failed and the backend was restarted
    Restarted,
    /// Shutdown began; the backend is left alone
    ShuttingDown,
}

/// Clears the restart flag however the restart future ends
struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct HealthMonitor<B: BackendControl = Supervisor> {
    backend: Arc<B>,
    readiness: Arc<Readiness>,
    pool: Arc<ConnectionPool>,
    lock: LockManager,
    config: HealthConfig,
    backend_port: u16,
    startup_timeout: Duration,
    consecutive_failures: AtomicU32,
    restart_in_progress: AtomicBool,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: BackendControl> HealthMonitor<B> {
    pub fn new(
        backend: Arc<B>,
        readiness: Arc<Readiness>,
        pool: Arc<ConnectionPool>,
        lock: LockManager,
        config: HealthConfig,
        backend_port: u16,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            readiness,
            pool,
            lock,
            config,
            backend_port,
            startup_timeout,
            consecutive_failures: AtomicU32::new(0),
            restart_in_progress: AtomicBool::new(false),
            // Never signalled unless replaced by `with_shutdown`
            shutdown_rx: watch::channel(false).1,
        }
    }

    /// Stop probing and restarting once `shutdown_rx` turns true
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = shutdown_rx;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn readiness(&self) -> &Arc<Readiness> {
        &self.readiness
    }

    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    pub fn is_restarting(&self) -> bool {
        self.restart_in_progress.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Resolves when shutdown is signalled; pends forever if it never can be
    async fn shutdown_signalled(&self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let closed = shutdown_rx.wait_for(|stop| *stop).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// One liveness probe; any HTTP answer counts as alive
    pub async fn probe(&self) -> bool {
        self.pool
            .probe(self.backend_port, &self.config.probe_path, self.config.probe_timeout())
            .await
    }

    /// Wait for a freshly started backend to become ready.
    ///
    /// A successful probe marks the backend ready even if it never printed a
    /// readiness marker.
    pub async fn await_startup(&self) -> StartupOutcome {
        let deadline = Instant::now() + self.startup_timeout;
        let poll_interval = self.config.startup_poll_interval();

        loop {
            if self.readiness.is_backend_ready() {
                return StartupOutcome::Ready;
            }

            match self.backend.state() {
                BackendState::Exited | BackendState::NotStarted => {
                    warn!("Backend exited before becoming ready");
                    return StartupOutcome::Exited;
                }
                BackendState::Starting | BackendState::Running => {}
            }

            if self.probe().await {
                if self.readiness.mark_backend_ready() {
                    info!(port = self.backend_port, "Backend answered probe, marking ready");
                }
                return StartupOutcome::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    timeout_secs = self.startup_timeout.as_secs(),
                    "Backend not answering after startup timeout"
                );
                return StartupOutcome::TimedOut;
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Fold a periodic probe result into the failure counter.
    ///
    /// Returns true once the unhealthy threshold is reached.
    pub fn record_probe(&self, healthy: bool) -> bool {
        if healthy {
            let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
            if previous > 0 {
                info!(previous_failures = previous, "Backend probe recovered");
            }
            if self.readiness.mark_backend_ready() {
                info!("Backend answered probe, marking ready");
            }
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            failures,
            threshold = self.config.unhealthy_threshold,
            "Backend probe failed"
        );
        failures >= self.config.unhealthy_threshold
    }

    /// Replace the backend process.
    ///
    /// Returns true once a new backend was started. Returns false without
    /// doing anything if a restart is already running or shutdown has
    /// begun, and gives up between stop and start if shutdown arrives then.
    pub async fn force_restart(&self) -> bool {
        if self.is_shutting_down() {
            debug!("Shutting down, not restarting backend");
            return false;
        }
        if self
            .restart_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Restart already in progress, skipping");
            return false;
        }
        let _guard = RestartGuard(&self.restart_in_progress);

        warn!("Forcing backend restart");
        self.readiness.mark_backend_not_ready();
        self.lock.cleanup();

        self.backend.stop().await;
        tokio::select! {
            _ = tokio::time::sleep(self.config.restart_cooldown()) => {}
            _ = self.shutdown_signalled() => {
                info!("Shutdown during restart cooldown, backend stays down");
                return false;
            }
        }
        if self.is_shutting_down() {
            return false;
        }

        let started = match self.backend.start() {
            Ok(outcome) => {
                debug!(?outcome, "Backend restarted, waiting for readiness");
                tokio::select! {
                    startup = self.await_startup() => info!(?startup, "Backend restart settled"),
                    _ = self.shutdown_signalled() => info!("Shutdown while restarted backend warms up"),
                }
                true
            }
            Err(SupervisorError::ShuttingDown) => {
                info!("Supervisor closed during restart, backend stays down");
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to restart backend");
                false
            }
        };

        self.consecutive_failures.store(0, Ordering::SeqCst);
        started
    }

    /// Reactive check after a forward exhausted its retries
    pub async fn on_forward_failure(&self) -> ReactiveOutcome {
        if self.is_shutting_down() {
            return ReactiveOutcome::ShuttingDown;
        }
        if self.is_restarting() {
            return ReactiveOutcome::RestartInProgress;
        }

        if let Some(age) = self.readiness.since_last_success() {
            if age < self.config.stale_after() {
                debug!(
                    last_success_ms = age.as_millis() as u64,
                    "Recent successful forward, skipping reactive probe"
                );
                return ReactiveOutcome::Fresh;
            }
        }

        if self.probe().await {
            debug!("Reactive probe answered, keeping backend");
            return ReactiveOutcome::Healthy;
        }

        warn!("Backend unreachable after retries, restarting");
        if self.force_restart().await {
            ReactiveOutcome::Restarted
        } else if self.is_shutting_down() {
            ReactiveOutcome::ShuttingDown
        } else {
            ReactiveOutcome::RestartInProgress
        }
    }

    /// Fire-and-forget variant of [`on_forward_failure`](Self::on_forward_failure)
    pub fn spawn_reactive_check(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                outcome = monitor.on_forward_failure() => {
                    debug!(?outcome, "Reactive health check finished");
                }
                _ = monitor.shutdown_signalled() => {
                    debug!("Reactive health check cancelled by shutdown");
                }
            }
        });
    }

    /// Periodic probing until shutdown
    pub async fn run(&self) {
        if self.is_shutting_down() {
            return;
        }

        let mut ready_rx = self.readiness.subscribe();
        tokio::select! {
            ready = ready_rx.wait_for(|ready| *ready) => {
                if ready.map(|_| ()).is_err() {
                    return;
                }
            }
            _ = self.shutdown_signalled() => {
                debug!("Health monitor stopped before backend became ready");
                return;
            }
        }

        info!(
            interval_ms = self.config.interval_ms,
            threshold = self.config.unhealthy_threshold,
            "Starting periodic health monitoring"
        );

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_signalled() => {
                    info!("Health monitor shutting down");
                    return;
                }
            }

            if self.is_restarting() {
                continue;
            }

            let healthy = self.probe().await;
            if self.record_probe(healthy) {
                self.force_restart().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::process::{StartOutcome, SupervisorError};
    use parking_lot::Mutex;
    use std::future::Future;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Records calls instead of managing a process
    struct RecordingBackend {
        starts: AtomicUsize,
        stops: AtomicUsize,
        state: Mutex<BackendState>,
    }

    impl RecordingBackend {
        fn new(state: BackendState) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                state: Mutex::new(state),
            })
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl BackendControl for RecordingBackend {
        fn start(&self) -> Result<StartOutcome, SupervisorError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.state.lock() = BackendState::Starting;
            Ok(StartOutcome::Spawned { pid: None })
        }

        fn stop(&self) -> impl Future<Output = ()> + Send {
            async {
                self.stops.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                *self.state.lock() = BackendState::Exited;
            }
        }

        fn state(&self) -> BackendState {
            *self.state.lock()
        }
    }

    fn fast_config() -> HealthConfig {
        HealthConfig {
            interval_ms: 20,
            probe_timeout_ms: 200,
            probe_path: "/".to_string(),
            unhealthy_threshold: 2,
            restart_cooldown_ms: 10,
            stale_after_secs: 60,
            startup_poll_interval_ms: 20,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    /// Minimal HTTP server that answers every request with 204
    async fn answering_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream
                            .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    struct Fixture {
        backend: Arc<RecordingBackend>,
        readiness: Arc<Readiness>,
        monitor: Arc<HealthMonitor<RecordingBackend>>,
        shutdown_tx: watch::Sender<bool>,
        _dir: TempDir,
        lock_path: std::path::PathBuf,
    }

    fn fixture(port: u16, state: BackendState) -> Fixture {
        fixture_with(port, state, fast_config())
    }

    fn fixture_with(port: u16, state: BackendState, config: HealthConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("SingletonLock");
        let backend = RecordingBackend::new(state);
        let readiness = Arc::new(Readiness::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = Arc::new(
            HealthMonitor::new(
                Arc::clone(&backend),
                Arc::clone(&readiness),
                Arc::new(ConnectionPool::new(PoolConfig::default())),
                LockManager::new(&lock_path),
                config,
                port,
                Duration::from_millis(150),
            )
            .with_shutdown(shutdown_rx),
        );
        Fixture {
            backend,
            readiness,
            monitor,
            shutdown_tx,
            _dir: dir,
            lock_path,
        }
    }

    #[tokio::test]
    async fn test_record_probe_threshold() {
        let f = fixture(closed_port().await, BackendState::Running);

        assert!(!f.monitor.record_probe(false));
        assert_eq!(f.monitor.consecutive_failures(), 1);
        assert!(f.monitor.record_probe(false));

        // Success resets the counter and marks ready
        assert!(!f.monitor.record_probe(true));
        assert_eq!(f.monitor.consecutive_failures(), 0);
        assert!(f.readiness.is_backend_ready());
    }

    #[tokio::test]
    async fn test_await_startup_marks_ready_on_probe() {
        let f = fixture(answering_port().await, BackendState::Starting);

        assert_eq!(f.monitor.await_startup().await, StartupOutcome::Ready);
        assert!(f.readiness.is_backend_ready());
    }

    #[tokio::test]
    async fn test_await_startup_stops_on_exit_and_timeout() {
        let f = fixture(closed_port().await, BackendState::Exited);
        assert_eq!(f.monitor.await_startup().await, StartupOutcome::Exited);

        let f = fixture(closed_port().await, BackendState::Starting);
        assert_eq!(f.monitor.await_startup().await, StartupOutcome::TimedOut);
        assert!(!f.readiness.is_backend_ready());
    }

    #[tokio::test]
    async fn test_force_restart_sequence() {
        let f = fixture(closed_port().await, BackendState::Running);
        f.readiness.mark_backend_ready();
        std::fs::write(&f.lock_path, "host-1").unwrap();

        assert!(f.monitor.force_restart().await);

        assert_eq!(f.backend.stops(), 1);
        assert_eq!(f.backend.starts(), 1);
        assert!(!f.readiness.is_backend_ready());
        assert!(!f.lock_path.exists());
        assert!(!f.monitor.is_restarting());
    }

    #[tokio::test]
    async fn test_concurrent_restarts_collapse_into_one() {
        let f = fixture(closed_port().await, BackendState::Running);

        let (a, b) = tokio::join!(f.monitor.force_restart(), f.monitor.force_restart());

        assert!(a ^ b);
        assert_eq!(f.backend.stops(), 1);
        assert_eq!(f.backend.starts(), 1);
    }

    #[tokio::test]
    async fn test_reactive_check_skipped_after_recent_success() {
        let f = fixture(closed_port().await, BackendState::Running);
        f.readiness.record_success();

        assert_eq!(f.monitor.on_forward_failure().await, ReactiveOutcome::Fresh);
        assert_eq!(f.backend.stops(), 0);
    }

    #[tokio::test]
    async fn test_reactive_check_keeps_answering_backend() {
        let f = fixture(answering_port().await, BackendState::Running);

        assert_eq!(f.monitor.on_forward_failure().await, ReactiveOutcome::Healthy);
        assert_eq!(f.backend.stops(), 0);
    }

    #[tokio::test]
    async fn test_reactive_check_restarts_dead_backend() {
        let f = fixture(closed_port().await, BackendState::Running);
        f.readiness.mark_backend_ready();

        assert_eq!(f.monitor.on_forward_failure().await, ReactiveOutcome::Restarted);
        assert_eq!(f.backend.stops(), 1);
        assert_eq!(f.backend.starts(), 1);
    }

    #[tokio::test]
    async fn test_periodic_monitor_restarts_after_threshold() {
        let f = fixture(closed_port().await, BackendState::Running);

        let monitor = Arc::clone(&f.monitor);
        let task = tokio::spawn(async move { monitor.run().await });

        // Nothing happens until the backend has been ready once
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.backend.stops(), 0);

        f.readiness.mark_backend_ready();
        for _ in 0..100 {
            if f.backend.starts() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(f.backend.starts() >= 1);
        assert!(f.backend.stops() >= 1);

        f.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_periodic_monitor_exits_on_shutdown_before_ready() {
        let f = fixture(closed_port().await, BackendState::Starting);

        let monitor = Arc::clone(&f.monitor);
        let task = tokio::spawn(async move { monitor.run().await });

        f.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_reactive_restart_keeps_backend_down() {
        let config = HealthConfig {
            restart_cooldown_ms: 400,
            ..fast_config()
        };
        let f = fixture_with(closed_port().await, BackendState::Running, config);
        f.readiness.mark_backend_ready();

        f.monitor.spawn_reactive_check();

        // Old backend stopped, restart now sitting in its cooldown
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(f.backend.stops(), 1);
        assert!(f.monitor.is_restarting());

        f.shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(f.backend.starts(), 0);
        assert_eq!(f.backend.state(), BackendState::Exited);
        assert!(!f.monitor.is_restarting());
    }

    #[tokio::test]
    async fn test_no_restart_after_shutdown() {
        let f = fixture(closed_port().await, BackendState::Running);
        f.shutdown_tx.send(true).unwrap();

        assert!(!f.monitor.force_restart().await);
        assert_eq!(f.monitor.on_forward_failure().await, ReactiveOutcome::ShuttingDown);
        assert_eq!(f.backend.stops(), 0);
        assert_eq!(f.backend.starts(), 0);
    }
}
