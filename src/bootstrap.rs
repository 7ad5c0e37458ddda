//! Startup sequence run while the proxy is already accepting requests

use crate::config::RuntimeConfig;
use crate::health::{HealthMonitor, StartupOutcome};
use crate::process::{BackendControl, StartOutcome, SupervisorError};
use crate::runtime;
use tracing::info;

/// Lock cleanup, runtime verification, backend start, then the startup watch.
///
/// Only a failed spawn is an error; a backend that is slow or dies during
/// warm-up is reported through the returned [`StartupOutcome`].
pub async fn bootstrap<B: BackendControl>(
    monitor: &HealthMonitor<B>,
    runtime_config: &RuntimeConfig,
) -> Result<StartupOutcome, SupervisorError> {
    monitor.lock().cleanup();

    runtime::prepare(runtime_config, monitor.readiness()).await;

    match monitor.backend().start()? {
        StartOutcome::Spawned { pid } => info!(pid, "Backend launched, waiting for readiness"),
        StartOutcome::AlreadyRunning => info!("Backend already running"),
    }

    Ok(monitor.await_startup().await)
}
