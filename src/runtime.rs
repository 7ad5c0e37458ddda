//! Browser runtime verification and optional installation

use crate::config::RuntimeConfig;
use crate::readiness::Readiness;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Whether `dir` holds an entry whose name starts with `prefix`
pub fn assets_present(dir: &Path, prefix: &str) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %dir.display(), error = %e, "Cannot read runtime assets directory");
            return false;
        }
    };

    entries
        .filter_map(Result::ok)
        .any(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
}

/// Run the configured installer with inherited stdio
async fn install(config: &RuntimeConfig) -> anyhow::Result<()> {
    let (program, args) = config
        .install_command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("No install command configured"))?;

    info!(command = %program, args = ?args, "Installing browser runtime");

    let status = Command::new(program)
        .args(args)
        .env("PLAYWRIGHT_BROWSERS_PATH", &config.assets_path)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run installer '{}': {}", program, e))?;

    if !status.success() {
        anyhow::bail!("Installer exited with {}", status);
    }
    Ok(())
}

/// Verify (and if allowed, install) runtime assets, then publish the result.
///
/// Never fails: a missing runtime only leaves `runtime_ready` false.
pub async fn prepare(config: &RuntimeConfig, readiness: &Readiness) -> bool {
    if !config.verify_assets {
        debug!("Runtime asset verification disabled");
        readiness.set_runtime_ready(true);
        return true;
    }

    let path = &config.assets_path;
    let mut ready = assets_present(path, &config.asset_prefix);

    if ready {
        info!(path = %path.display(), prefix = %config.asset_prefix, "Browser runtime found");
    } else if config.auto_install {
        warn!(path = %path.display(), "Browser runtime missing, auto-install enabled");
        match install(config).await {
            Ok(()) => {
                ready = assets_present(path, &config.asset_prefix);
                if ready {
                    info!("Browser runtime installed");
                } else {
                    error!(path = %path.display(), "Installer finished but runtime is still missing");
                }
            }
            Err(e) => error!(error = %e, "Browser runtime installation failed"),
        }
    } else {
        warn!(
            path = %path.display(),
            prefix = %config.asset_prefix,
            "Browser runtime missing; set PLAYWRIGHT_AUTO_INSTALL=true to install it at startup"
        );
    }

    readiness.set_runtime_ready(ready);
    ready
}
