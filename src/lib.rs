//! Warmgate - a warm-up sidecar for a slow-starting browser automation backend
//!
//! This library provides a reverse proxy that sits in front of a single
//! supervised backend process and:
//! - Spawns the backend and tracks its readiness from its output and probes
//! - Answers the JSON-RPC handshake locally while the backend warms up
//! - Forwards traffic once ready, retrying transient connection failures
//! - Restarts the backend when liveness probes keep failing
//! - Cleans up stale browser profile locks around every (re)start

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod forward;
pub mod health;
pub mod lock;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod retry;
pub mod runtime;
pub mod shim;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
