use crate::config::BackendConfig;
use crate::lock::LockManager;
use crate::readiness::Readiness;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Lifecycle of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Never started, or the last spawn attempt failed
    NotStarted,
    /// Spawned, waiting for a readiness signal
    Starting,
    /// Signalled readiness
    Running,
    /// The process has terminated
    Exited,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::NotStarted => "not_started",
            BackendState::Starting => "starting",
            BackendState::Running => "running",
            BackendState::Exited => "exited",
        }
    }
}

/// Result of a successful [`Supervisor::start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was spawned
    Spawned { pid: Option<u32> },
    /// A process is already starting or running; nothing was done
    AlreadyRunning,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to create session directory {}: {source}", .path.display())]
    SessionDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to spawn backend '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("Supervisor is shutting down, backend not started")]
    ShuttingDown,
}

/// What a line on the backend's stderr tells us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrSignal {
    /// The executable or profile is held by another process
    FileBusy,
    /// Browser binaries or system libraries are absent
    MissingDependency,
    Unclassified,
}

const FILE_BUSY_PATTERNS: &[&str] = &["ETXTBSY", "Text file busy"];

const MISSING_DEPENDENCY_PATTERNS: &[&str] = &[
    "Executable doesn't exist",
    "Host system is missing dependencies",
    "error while loading shared libraries",
];

pub fn classify_stderr(line: &str) -> StderrSignal {
    if FILE_BUSY_PATTERNS.iter().any(|p| line.contains(p)) {
        StderrSignal::FileBusy
    } else if MISSING_DEPENDENCY_PATTERNS.iter().any(|p| line.contains(p)) {
        StderrSignal::MissingDependency
    } else {
        StderrSignal::Unclassified
    }
}

/// Start/stop surface the health monitor drives.
///
/// Implemented by [`Supervisor`]; tests substitute a recording double.
pub trait BackendControl: Send + Sync + 'static {
    fn start(&self) -> Result<StartOutcome, SupervisorError>;
    fn stop(&self) -> impl Future<Output = ()> + Send;
    fn state(&self) -> BackendState;
}

/// The live child process of one generation
struct BackendProcess {
    pid: Option<u32>,
    generation: u64,
    /// Asks the exit watcher to terminate the child
    stop_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

struct Inner {
    state: BackendState,
    /// Bumped on every spawn so late events from an old child are ignored
    generation: u64,
    process: Option<BackendProcess>,
    startup_timer: Option<AbortHandle>,
    /// Set by [`Supervisor::shutdown`]; no spawn happens afterwards
    closed: bool,
}

struct Shared {
    config: BackendConfig,
    readiness: Arc<Readiness>,
    lock: LockManager,
    inner: Mutex<Inner>,
}

/// Owns the backend OS process.
///
/// Cheap to clone; all clones share one process slot. The supervisor never
/// restarts the backend on its own, that decision belongs to the health
/// monitor.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(config: BackendConfig, readiness: Arc<Readiness>) -> Self {
        let lock = LockManager::new(config.lock_file());
        Self {
            shared: Arc::new(Shared {
                config,
                readiness,
                lock,
                inner: Mutex::new(Inner {
                    state: BackendState::NotStarted,
                    generation: 0,
                    process: None,
                    startup_timer: None,
                    closed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    pub fn lock(&self) -> &LockManager {
        &self.shared.lock
    }

    pub fn state(&self) -> BackendState {
        self.shared.inner.lock().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared
            .inner
            .lock()
            .process
            .as_ref()
            .and_then(|p| p.pid)
    }

    /// Spawn the backend unless one is already starting or running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<StartOutcome, SupervisorError> {
        let shared = &self.shared;
        let config = &shared.config;
        let mut inner = shared.inner.lock();

        if inner.closed {
            debug!("Supervisor closed, refusing to start backend");
            return Err(SupervisorError::ShuttingDown);
        }

        if matches!(inner.state, BackendState::Starting | BackendState::Running) {
            debug!(state = inner.state.as_str(), "Backend already starting or running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        for dir in [config.user_data_dir(), config.output_dir()] {
            if let Err(source) = std::fs::create_dir_all(&dir) {
                inner.state = BackendState::NotStarted;
                return Err(SupervisorError::SessionDir { path: dir, source });
            }
        }

        let args = config.full_args();
        info!(command = %config.command, args = ?args, "Starting backend");

        let mut cmd = Command::new(&config.command);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = config.working_dir {
            cmd.current_dir(working_dir);
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                inner.state = BackendState::NotStarted;
                return Err(SupervisorError::Spawn {
                    command: config.command.clone(),
                    source,
                });
            }
        };

        inner.generation += 1;
        let generation = inner.generation;
        let pid = child.id();
        info!(pid, generation, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stdout(Arc::clone(shared), stdout, generation));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(Arc::clone(shared), stderr));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_exit(Arc::clone(shared), child, generation, stop_rx));

        if let Some(old) = inner.startup_timer.take() {
            old.abort();
        }
        let timer = tokio::spawn(startup_timer(Arc::clone(shared), generation));

        inner.state = BackendState::Starting;
        inner.startup_timer = Some(timer.abort_handle());
        inner.process = Some(BackendProcess {
            pid,
            generation,
            stop_tx: Some(stop_tx),
            watcher: Some(watcher),
        });

        Ok(StartOutcome::Spawned { pid })
    }

    /// Terminate the backend: SIGTERM, grace period, then SIGKILL.
    ///
    /// Returns once the process has been reaped. Calling it with nothing
    /// running is a no-op.
    pub async fn stop(&self) {
        let process = {
            let mut inner = self.shared.inner.lock();
            if let Some(timer) = inner.startup_timer.take() {
                timer.abort();
            }
            inner.process.take()
        };

        let Some(mut process) = process else {
            debug!("Backend not running, nothing to stop");
            return;
        };

        info!(pid = process.pid, generation = process.generation, "Stopping backend");

        if let Some(stop_tx) = process.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(watcher) = process.watcher.take() {
            if let Err(e) = watcher.await {
                warn!(error = %e, "Backend exit watcher failed");
            }
        }
    }

    /// Stop the backend for good.
    ///
    /// Any later [`start`](Self::start) fails with
    /// [`SupervisorError::ShuttingDown`], so a restart racing the process
    /// exit cannot bring a backend back.
    pub async fn shutdown(&self) {
        self.shared.inner.lock().closed = true;
        self.stop().await;
    }
}

impl BackendControl for Supervisor {
    fn start(&self) -> Result<StartOutcome, SupervisorError> {
        Supervisor::start(self)
    }

    fn stop(&self) -> impl Future<Output = ()> + Send {
        Supervisor::stop(self)
    }

    fn state(&self) -> BackendState {
        Supervisor::state(self)
    }
}

impl Shared {
    /// The backend announced (or was observed) accepting connections
    fn on_ready_signal(&self, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != BackendState::Starting {
                return;
            }
            inner.state = BackendState::Running;
            if let Some(timer) = inner.startup_timer.take() {
                timer.abort();
            }
        }

        if self.readiness.mark_backend_ready() {
            info!(generation, "Backend is ready");
        }
    }

    fn record_exit(&self, generation: u64, status: std::io::Result<ExitStatus>) {
        {
            let mut inner = self.inner.lock();
            if inner.process.as_ref().map(|p| p.generation) == Some(generation) {
                inner.process = None;
            }
            if inner.generation == generation {
                inner.state = BackendState::Exited;
                if let Some(timer) = inner.startup_timer.take() {
                    timer.abort();
                }
            }
        }

        match status {
            Ok(status) if status.success() => info!(generation, "Backend exited"),
            Ok(status) => match status.code() {
                Some(code) => error!(generation, code, "Backend exited with non-zero status"),
                None => warn!(generation, status = %status, "Backend terminated by signal"),
            },
            Err(e) => error!(generation, error = %e, "Failed to wait for backend"),
        }
    }
}

async fn pump_stdout(shared: Arc<Shared>, stdout: ChildStdout, generation: u64) {
    let mut lines = BufReader::new(stdout).lines();
    let mut announced = false;

    while let Ok(Some(line)) = lines.next_line().await {
        info!(stream = "stdout", "{}", line);
        if !announced && shared.config.is_ready_line(&line) {
            announced = true;
            shared.on_ready_signal(generation);
        }
    }
}

async fn pump_stderr(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        match classify_stderr(&line) {
            StderrSignal::FileBusy => {
                warn!(stream = "stderr", "{}", line);
                warn!(lock = %shared.lock.path().display(), "Backend reported a busy file, removing lock marker");
                shared.lock.cleanup();
            }
            StderrSignal::MissingDependency => {
                error!(stream = "stderr", "{}", line);
                error!(
                    "Browser runtime is missing; install it with \
                     `npx playwright install --with-deps chromium` or set PLAYWRIGHT_AUTO_INSTALL=true"
                );
            }
            StderrSignal::Unclassified => warn!(stream = "stderr", "{}", line),
        }
    }
}

async fn watch_exit(
    shared: Arc<Shared>,
    mut child: Child,
    generation: u64,
    stop_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => terminate(&mut child, shared.config.shutdown_grace_period()).await,
    };
    shared.record_exit(generation, status);
}

async fn terminate(child: &mut Child, grace_period: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        info!(pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

/// Warns if the backend never signals readiness; cancelled once it does
async fn startup_timer(shared: Arc<Shared>, generation: u64) {
    let timeout = shared.config.startup_timeout();
    let mut ready_rx = shared.readiness.subscribe();

    // Copy out of the watch guard before touching readiness again
    let waited = tokio::time::timeout(timeout, ready_rx.wait_for(|ready| *ready))
        .await
        .map(|r| r.map(|ready| *ready));

    match waited {
        Ok(Ok(_)) => shared.on_ready_signal(generation),
        Ok(Err(_)) => {}
        Err(_) => warn!(
            timeout_secs = timeout.as_secs(),
            "Backend did not signal readiness in time, continuing anyway"
        ),
    }
}
