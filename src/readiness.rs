//! Shared readiness state consulted by every inbound request

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// The sidecar's belief about whether the backend can serve traffic.
///
/// There is exactly one instance per process. The supervisor and health
/// monitor write it; the proxy and shim only read it.
pub struct Readiness {
    /// Backend ready flag, also broadcast to waiters
    backend_tx: watch::Sender<bool>,
    /// Browser/runtime assets verified
    runtime_ready: AtomicBool,
    /// Last time a forwarded request got a response
    last_success: Mutex<Option<Instant>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (backend_tx, _) = watch::channel(false);
        Self {
            backend_tx,
            runtime_ready: AtomicBool::new(false),
            last_success: Mutex::new(None),
        }
    }

    pub fn is_backend_ready(&self) -> bool {
        *self.backend_tx.borrow()
    }

    pub fn is_runtime_ready(&self) -> bool {
        self.runtime_ready.load(Ordering::SeqCst)
    }

    /// Both flags set: what the health endpoint reports as healthy
    pub fn is_healthy(&self) -> bool {
        self.is_backend_ready() && self.is_runtime_ready()
    }

    /// Mark the backend ready. Returns true on the not-ready to ready transition.
    pub fn mark_backend_ready(&self) -> bool {
        self.backend_tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Mark the backend not ready. Returns true if it was ready before.
    pub fn mark_backend_not_ready(&self) -> bool {
        self.backend_tx.send_if_modified(|ready| {
            if *ready {
                *ready = false;
                true
            } else {
                false
            }
        })
    }

    pub fn set_runtime_ready(&self, ready: bool) {
        self.runtime_ready.store(ready, Ordering::SeqCst);
    }

    /// Subscribe to backend-ready transitions
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.backend_tx.subscribe()
    }

    /// Record a successfully forwarded request
    pub fn record_success(&self) {
        *self.last_success.lock() = Some(Instant::now());
    }

    /// Time since the last successful forward, `None` if there never was one
    pub fn since_last_success(&self) -> Option<Duration> {
        self.last_success.lock().map(|t| t.elapsed())
    }
}
