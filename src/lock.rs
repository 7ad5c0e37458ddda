//! Stale lock marker cleanup
//!
//! The backend's browser refuses to launch when a profile lock from a
//! previous, uncleanly terminated run is still on disk. The marker carries
//! no meaning for the sidecar itself, so removal is always best-effort.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Removes the lock marker left behind by a previous backend instance
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the marker if present. Returns true if a file was removed.
    ///
    /// Never fails: filesystem errors are logged and swallowed.
    pub fn cleanup(&self) -> bool {
        // symlink_metadata so a dangling SingletonLock symlink is still seen
        match std::fs::symlink_metadata(&self.path) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No lock marker to clean up");
                return false;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to inspect lock marker");
                return false;
            }
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed stale lock marker");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove lock marker");
                false
            }
        }
    }

    /// Guard that runs [`cleanup`](Self::cleanup) when dropped
    pub fn guard(&self) -> LockGuard {
        LockGuard {
            manager: self.clone(),
        }
    }
}

/// Runs lock cleanup on drop, so every exit path of `main` ends with it
pub struct LockGuard {
    manager: LockManager,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.cleanup();
    }
}
