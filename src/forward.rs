//! Request forwarding to the backend with bounded retries

use crate::config::ProxyConfig;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolError};
use crate::readiness::Readiness;
use crate::retry::{RetryError, RetryPolicy};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::http::request::Parts;
use hyper::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

/// Called when a request exhausted every retry
pub type FailureHook = Arc<dyn Fn() + Send + Sync>;

/// Connection-scoped headers that must not be replayed to the backend
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ForwardError {
    pub fn is_transient(&self) -> bool {
        match self {
            ForwardError::Timeout(_) => false,
            ForwardError::Pool(e) => e.is_transient(),
        }
    }
}

pub struct Forwarder {
    pool: Arc<ConnectionPool>,
    readiness: Arc<Readiness>,
    retry: RetryPolicy,
    backend_port: u16,
    request_timeout: Option<Duration>,
    max_body_bytes: usize,
    semaphore: Arc<Semaphore>,
    on_exhausted: Option<FailureHook>,
}

impl Forwarder {
    pub fn new(
        pool: Arc<ConnectionPool>,
        readiness: Arc<Readiness>,
        config: &ProxyConfig,
        backend_port: u16,
    ) -> Self {
        Self {
            pool,
            readiness,
            retry: RetryPolicy::new(config.retry_delays()),
            backend_port,
            request_timeout: config.request_timeout(),
            max_body_bytes: config.max_body_bytes,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            on_exhausted: None,
        }
    }

    /// Set the hook run after retries are exhausted (builder pattern)
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.on_exhausted = Some(hook);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Requests currently allowed to start before the limit is hit
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Forward a request and stream the backend's answer back.
    ///
    /// Never fails: every problem becomes a JSON error response.
    pub async fn forward<B>(&self, req: Request<B>) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return json_error_response(ProxyErrorCode::InternalError, "Proxy is shutting down");
            }
        };

        let (parts, body) = req.into_parts();

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!(limit = self.max_body_bytes, uri = %parts.uri, "Request body too large");
                return json_error_response(
                    ProxyErrorCode::PayloadTooLarge,
                    format!("Request body exceeds {} bytes", self.max_body_bytes),
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return json_error_response(ProxyErrorCode::BadRequest, "Failed to read request body");
            }
        };

        let result = self
            .retry
            .run(
                |attempt| {
                    let req = self.build_request(&parts, &body);
                    async move {
                        if attempt > 0 {
                            self.pool.stats().record_retry();
                        }
                        self.send(req?).await
                    }
                },
                ForwardError::is_transient,
            )
            .await;

        match result {
            Ok(response) => {
                self.readiness.record_success();
                let (parts, body) = response.into_parts();
                // The permit rides along until the body is fully streamed
                let body = body
                    .map_frame(move |frame| {
                        let _ = &permit;
                        frame
                    })
                    .boxed();
                Response::from_parts(parts, body)
            }
            Err(failure) => self.failure_response(&parts, failure),
        }
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, ForwardError> {
        match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.pool.send_request(req))
                .await
                .map_err(|_| ForwardError::Timeout(timeout))?
                .map_err(ForwardError::from),
            None => Ok(self.pool.send_request(req).await?),
        }
    }

    /// Rebuild the outbound request; called once per attempt
    fn build_request(&self, parts: &Parts, body: &Bytes) -> Result<Request<Full<Bytes>>, PoolError> {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://127.0.0.1:{}{}", self.backend_port, path);

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);

        if let Some(headers) = builder.headers_mut() {
            for (name, value) in parts.headers.iter() {
                if name == HOST || is_hop_by_hop(name) {
                    continue;
                }
                headers.append(name.clone(), value.clone());
            }
            let host = format!("localhost:{}", self.backend_port);
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(HOST, value);
            }
        }

        builder
            .body(Full::new(body.clone()))
            .map_err(|e| PoolError::RequestBuild(e.to_string()))
    }

    fn failure_response(
        &self,
        parts: &Parts,
        failure: RetryError<ForwardError>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let RetryError {
            error: err,
            attempts,
            exhausted,
        } = failure;

        match err {
            ForwardError::Timeout(timeout) => {
                warn!(
                    method = %parts.method,
                    uri = %parts.uri,
                    timeout_secs = timeout.as_secs(),
                    "Backend request timed out"
                );
                json_error_response(
                    ProxyErrorCode::GatewayTimeout,
                    format!("Backend did not respond within {} seconds", timeout.as_secs()),
                )
            }
            ForwardError::Pool(e) if exhausted => {
                error!(
                    method = %parts.method,
                    uri = %parts.uri,
                    attempts,
                    error = %e,
                    "Backend unreachable, retries exhausted"
                );
                if let Some(hook) = &self.on_exhausted {
                    hook();
                }
                json_error_response(
                    ProxyErrorCode::BackendUnavailable,
                    format!("Backend unreachable after {} attempts: {}", attempts, e),
                )
            }
            ForwardError::Pool(e) => {
                error!(method = %parts.method, uri = %parts.uri, error = %e, "Failed to forward request");
                json_error_response(
                    ProxyErrorCode::BackendUnavailable,
                    format!("Failed to forward request: {}", e),
                )
            }
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Backend that echoes the request line, host header and body
    async fn echo_backend(status: StatusCode, hits: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let hits = Arc::clone(&hits);
                        async move {
                            hits.fetch_add(1, Ordering::SeqCst);
                            let method = req.method().clone();
                            let uri = req.uri().clone();
                            let host = req
                                .headers()
                                .get(HOST)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or("")
                                .to_string();
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            let text = format!(
                                "{} {} host={} body={}",
                                method,
                                uri,
                                host,
                                String::from_utf8_lossy(&body)
                            );
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .header("x-backend", "echo")
                                    .body(Full::new(Bytes::from(text)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn forwarder(port: u16) -> (Forwarder, Arc<Readiness>) {
        let readiness = Arc::new(Readiness::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let forwarder = Forwarder::new(pool, Arc::clone(&readiness), &ProxyConfig::default(), port)
            .with_retry_policy(RetryPolicy::new(vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
            ]));
        (forwarder, readiness)
    }

    fn post(uri: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(HOST, "proxy.example:8081")
            .header("connection", "keep-alive")
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_string(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_forwards_request_and_rewrites_host() {
        let hits = Arc::new(AtomicUsize::new(0));
        let port = echo_backend(StatusCode::OK, Arc::clone(&hits)).await;
        let (forwarder, readiness) = forwarder(port);

        let response = forwarder.forward(post("/mcp?session=abc", r#"{"id":1}"#)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-backend").unwrap(), "echo");
        let body = body_string(response).await;
        assert_eq!(
            body,
            format!(r#"POST /mcp?session=abc host=localhost:{} body={{"id":1}}"#, port)
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(readiness.since_last_success().is_some());
    }

    #[tokio::test]
    async fn test_backend_errors_pass_through_without_retry() {
        let hits = Arc::new(AtomicUsize::new(0));
        let port = echo_backend(StatusCode::NOT_FOUND, Arc::clone(&hits)).await;
        let (forwarder, _) = forwarder(port);

        let response = forwarder.forward(post("/missing", "")).await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("X-Proxy-Error").is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(forwarder.pool().stats().get_retries(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_502_and_fire_hook() {
        let port = closed_port().await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let (forwarder, readiness) = forwarder(port);
        let forwarder = forwarder.with_failure_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let response = forwarder.forward(post("/mcp", "{}")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "BACKEND_UNAVAILABLE");
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["error"], "Backend service unavailable");
        assert!(json["message"].as_str().unwrap().contains("3 attempts"));
        assert_eq!(json["code"], "BACKEND_UNAVAILABLE");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(forwarder.pool().stats().get_retries(), 2);
        assert_eq!(forwarder.pool().stats().get_total_requests(), 3);
        assert!(readiness.since_last_success().is_none());
    }

    #[tokio::test]
    async fn test_slow_backend_yields_504_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let (forwarder, _) = forwarder(port);
        let forwarder = forwarder.with_request_timeout(Some(Duration::from_millis(100)));

        let response = forwarder.forward(post("/mcp", "{}")).await;

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "GATEWAY_TIMEOUT");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(forwarder.pool().stats().get_retries(), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let hits = Arc::new(AtomicUsize::new(0));
        let port = echo_backend(StatusCode::OK, Arc::clone(&hits)).await;
        let readiness = Arc::new(Readiness::new());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let config = ProxyConfig {
            max_body_bytes: 8,
            ..ProxyConfig::default()
        };
        let forwarder = Forwarder::new(pool, readiness, &config, port);

        let response = forwarder.forward(post("/mcp", "0123456789abcdef")).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_permit_released_after_body_consumed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let port = echo_backend(StatusCode::OK, Arc::clone(&hits)).await;
        let (forwarder, _) = forwarder(port);
        let slots = forwarder.available_slots();

        let response = forwarder.forward(post("/mcp", "{}")).await;
        assert_eq!(forwarder.available_slots(), slots - 1);

        drop(body_string(response).await);
        assert_eq!(forwarder.available_slots(), slots);
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("mcp-session-id")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }
}
