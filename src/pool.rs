//! Pooled loopback HTTP clients for the supervised backend
//!
//! One pooled client carries forwarded requests to the backend's loopback
//! port; a second, dedicated client carries liveness probes so a saturated
//! forwarding pool never delays health decisions.

use crate::retry::is_transient_io;
use http_body_util::{Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Why a pooled request could not be completed
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// Whether the error is a connection-level failure worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::Client(err) => {
                if err.is_connect() {
                    return true;
                }
                let mut source = err.source();
                while let Some(cause) = source {
                    if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                        return is_transient_io(io_err.kind());
                    }
                    source = cause.source();
                }
                false
            }
            PoolError::RequestBuild(_) => false,
        }
    }
}

/// Counters logged at shutdown
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Forward attempts, retries included
    pub total_requests: AtomicU64,
    /// Requests that were re-sent after a transient failure
    pub retries: AtomicU64,
    /// Total number of health probes
    pub health_checks: AtomicU64,
}

impl PoolStats {
    /// One forward attempt
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried request
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// One liveness probe
    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections to the backend
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// TCP keep-alive on backend sockets
    pub tcp_keepalive: Option<Duration>,
    /// Connect timeout
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
            connect_timeout: Some(Duration::from_secs(1)),
        }
    }
}

impl PoolConfig {
    pub fn from_proxy_config(config: &crate::config::ProxyConfig) -> Self {
        Self {
            max_idle_per_host: config.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.pool_idle_timeout_secs),
            tcp_keepalive: (config.tcp_keepalive_secs > 0)
                .then(|| Duration::from_secs(config.tcp_keepalive_secs)),
            connect_timeout: (config.connect_timeout_ms > 0)
                .then(|| Duration::from_millis(config.connect_timeout_ms)),
        }
    }
}

/// A connection pool for HTTP connections to the backend
pub struct ConnectionPool {
    /// Main client for proxying requests (bodies are buffered so they can be replayed)
    client: Client<HttpConnector, Full<Bytes>>,
    /// Dedicated client for health probes (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_keepalive(config.tcp_keepalive);
        connector.set_connect_timeout(config.connect_timeout);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        // Probes never need more than one warm connection
        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            keepalive_secs = config.tcp_keepalive.map(|d| d.as_secs()),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send one forward attempt over the pooled client
    pub async fn send_request(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, PoolError> {
        self.stats.record_request();
        Ok(self.client.request(req).await?)
    }

    /// Check whether the backend answers HTTP at all.
    ///
    /// Any response, whatever its status, counts as reachable.
    pub async fn probe(&self, port: u16, path: &str, timeout: Duration) -> bool {
        let uri = format!("http://127.0.0.1:{}{}", port, path);

        let req = match Request::builder()
            .method("GET")
            .uri(&uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_health_check();

        match tokio::time::timeout(timeout, self.health_client.request(req)).await {
            Ok(Ok(response)) => {
                debug!(port, status = %response.status(), "Backend probe answered");
                true
            }
            Ok(Err(e)) => {
                debug!(port, error = %e, "Backend probe failed");
                false
            }
            Err(_) => {
                debug!(port, timeout_ms = timeout.as_millis() as u64, "Backend probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.tcp_keepalive, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_pool_config_from_proxy_config() {
        let mut proxy = crate::config::ProxyConfig::default();
        proxy.tcp_keepalive_secs = 0;
        proxy.pool_max_idle_per_host = 4;

        let config = PoolConfig::from_proxy_config(&proxy);
        assert_eq!(config.max_idle_per_host, 4);
        assert_eq!(config.tcp_keepalive, None);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();

        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_health_checks(), 0);

        stats.record_request();
        stats.record_retry();
        stats.record_health_check();
        assert_eq!(stats.get_total_requests(), 1);
        assert_eq!(stats.get_retries(), 1);
        assert_eq!(stats.get_health_checks(), 1);
    }

    /// Reserve a loopback port that nothing listens on
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn test_probe_closed_port_is_unreachable() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let port = closed_port().await;

        assert!(!pool.probe(port, "/", Duration::from_millis(500)).await);
        assert_eq!(pool.stats().get_health_checks(), 1);
    }

    #[tokio::test]
    async fn test_probe_accepts_any_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let pool = ConnectionPool::new(PoolConfig::default());
        assert!(pool.probe(port, "/", Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let port = closed_port().await;

        let req = Request::builder()
            .uri(format!("http://127.0.0.1:{}/", port))
            .body(Full::new(Bytes::new()))
            .unwrap();

        let err = pool.send_request(req).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!PoolError::RequestBuild("bad".into()).is_transient());
    }
}
