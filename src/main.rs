use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use warmgate::bootstrap::bootstrap;
use warmgate::config::Config;
use warmgate::forward::Forwarder;
use warmgate::health::HealthMonitor;
use warmgate::lock::LockManager;
use warmgate::pool::{ConnectionPool, PoolConfig};
use warmgate::process::Supervisor;
use warmgate::proxy::{ProxyServer, ProxyState};
use warmgate::readiness::Readiness;
use warmgate::shim::ProtocolShim;
use warmgate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warmgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Optional config file, then environment overrides
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::resolve(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    // Dropped last, so every exit path ends with lock cleanup
    let lock = LockManager::new(config.backend.lock_file());
    let _lock_guard = lock.guard();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let readiness = Arc::new(Readiness::new());
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from_proxy_config(&config.proxy)));
    let supervisor = Arc::new(Supervisor::new(config.backend.clone(), Arc::clone(&readiness)));

    let monitor = Arc::new(
        HealthMonitor::new(
            Arc::clone(&supervisor),
            Arc::clone(&readiness),
            Arc::clone(&pool),
            lock.clone(),
            config.health.clone(),
            config.backend.port,
            config.backend.startup_timeout(),
        )
        .with_shutdown(shutdown_rx.clone()),
    );

    let hook_monitor = Arc::clone(&monitor);
    let forwarder = Forwarder::new(
        Arc::clone(&pool),
        Arc::clone(&readiness),
        &config.proxy,
        config.backend.port,
    )
    .with_failure_hook(Arc::new(move || hook_monitor.spawn_reactive_check()));

    let shim = ProtocolShim::new(config.shim.clone(), config.proxy.retry_after_secs);
    let state = ProxyState::new(
        Arc::clone(&readiness),
        forwarder,
        shim,
        config.proxy.rpc_path.clone(),
        config.proxy.retry_after_secs,
    );

    // Listen before the backend starts so warm-up is covered
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind proxy listener");
        anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)
    })?;

    let proxy = ProxyServer::new(bind_addr, state, shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Bootstrap: lock cleanup, runtime check, spawn, startup watch
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);
    let exit_on_spawn_failure = config.backend.exit_on_spawn_failure;
    let bootstrap_handle = {
        let monitor = Arc::clone(&monitor);
        let runtime_config = config.runtime.clone();
        tokio::spawn(async move {
            match bootstrap(&monitor, &runtime_config).await {
                Ok(outcome) => info!(?outcome, "Bootstrap finished"),
                Err(e) => {
                    error!(error = %e, "Failed to start backend");
                    if exit_on_spawn_failure {
                        let _ = fatal_tx.send(e.to_string()).await;
                    } else {
                        warn!("Continuing without a backend; requests will be answered as starting");
                    }
                }
            }
        })
    };

    let monitor_handle = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move { monitor.run().await })
    };

    let fatal = wait_for_shutdown(&mut fatal_rx).await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    bootstrap_handle.abort();

    // Closed before stopping, so an in-flight restart cannot respawn
    info!("Stopping backend...");
    supervisor.shutdown().await;
    lock.cleanup();

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = monitor_handle.await;
        let _ = proxy_handle.await;
    })
    .await;

    let stats = pool.stats();
    info!(
        requests = stats.get_total_requests(),
        retries = stats.get_retries(),
        health_checks = stats.get_health_checks(),
        "Connection pool statistics"
    );

    match fatal {
        Some(reason) => {
            error!(reason = %reason, "Exiting after fatal startup failure");
            anyhow::bail!("Backend could not be started: {}", reason)
        }
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

/// Block until SIGINT/SIGTERM or a fatal startup failure.
///
/// Returns the failure reason when shutting down because of one.
async fn wait_for_shutdown(fatal_rx: &mut mpsc::Receiver<String>) -> anyhow::Result<Option<String>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                Ok(None)
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                Ok(None)
            }
            Some(reason) = fatal_rx.recv() => Ok(Some(reason)),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
                Ok(None)
            }
            Some(reason) = fatal_rx.recv() => Ok(Some(reason)),
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting warm-up proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        environment = config.server.environment.as_deref().unwrap_or("unset"),
        rpc_path = %config.proxy.rpc_path,
        "Server configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        port = config.backend.port,
        user_data_dir = %config.backend.user_data_dir().display(),
        output_dir = %config.backend.output_dir().display(),
        startup_timeout_secs = config.backend.startup_timeout_secs,
        "Backend configuration"
    );
    info!(
        interval_ms = config.health.interval_ms,
        probe_timeout_ms = config.health.probe_timeout_ms,
        unhealthy_threshold = config.health.unhealthy_threshold,
        restart_cooldown_ms = config.health.restart_cooldown_ms,
        "Health check settings"
    );
    info!(
        retry_delays_ms = ?config.proxy.retry_delays_ms,
        request_timeout_secs = config.proxy.request_timeout_secs,
        max_connections = config.proxy.max_connections,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        "Forwarding settings"
    );
    info!(
        assets_path = %config.runtime.assets_path.display(),
        verify_assets = config.runtime.verify_assets,
        auto_install = config.runtime.auto_install,
        "Browser runtime settings"
    );
}
