use crate::error::{full_body, service_starting_response};
use crate::forward::Forwarder;
use crate::readiness::Readiness;
use crate::shim::ProtocolShim;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const CORS_HEADERS: &[(&str, &str)] = &[
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST, OPTIONS"),
    ("access-control-allow-headers", "Content-Type, Authorization"),
    ("access-control-expose-headers", "mcp-session-id, mcp-protocol-version"),
];

/// Everything a request handler needs, shared across connections
pub struct ProxyState {
    readiness: Arc<Readiness>,
    forwarder: Forwarder,
    shim: ProtocolShim,
    rpc_path: String,
    retry_after_secs: u64,
}

impl ProxyState {
    pub fn new(
        readiness: Arc<Readiness>,
        forwarder: Forwarder,
        shim: ProtocolShim,
        rpc_path: impl Into<String>,
        retry_after_secs: u64,
    ) -> Self {
        let rpc_path = rpc_path.into();
        let rpc_path = match rpc_path.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };
        Self {
            readiness,
            forwarder,
            shim,
            rpc_path,
            retry_after_secs,
        }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// `/mcp` and anything below it; the query never matters
    pub fn is_rpc_path(&self, path: &str) -> bool {
        if self.rpc_path == "/" {
            return true;
        }
        match path.strip_prefix(self.rpc_path.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// The front door: health, CORS, warm-up gating and forwarding
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, state: ProxyState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, state: Arc<ProxyState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let mut response = route(req, &state, client_addr).await;
    apply_cors(response.headers_mut());
    Ok(response)
}

async fn route(
    mut req: Request<Incoming>,
    state: &ProxyState,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if req.method() == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::OK)
            .body(full_body(Bytes::new()))
            .expect("valid response builder");
    }

    let path = req.uri().path();
    if req.method() == Method::GET && (path == "/health" || path == "/healthz") {
        return health_response(&state.readiness);
    }

    if !state.readiness.is_backend_ready() {
        if req.method() == Method::POST && state.is_rpc_path(path) {
            let (parts, body) = req.into_parts();
            return state.shim.respond(&parts.headers, body).await;
        }
        debug!(method = %req.method(), uri = %req.uri(), "Backend not ready, deferring request");
        return service_starting_response(state.retry_after_secs);
    }

    let request_id = set_forwarding_headers(req.headers_mut(), client_addr);
    debug!(method = %req.method(), uri = %req.uri(), request_id, "Forwarding request");

    state.forwarder.forward(req).await
}

/// Set correlation and `x-forwarded-*` headers; returns the request ID.
///
/// Forwarded headers are overwritten, not appended: the sidecar is the
/// first trusted hop.
fn set_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr) -> String {
    let request_id = headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

fn health_response(readiness: &Readiness) -> Response<BoxBody<Bytes, hyper::Error>> {
    let healthy = readiness.is_healthy();
    let (status, label) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    };

    let body = serde_json::json!({
        "status": label,
        "backend": readiness.is_backend_ready(),
        "runtime": readiness.is_runtime_ready(),
    });

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("Cache-Control", "no-cache")
        .body(full_body(body.to_string()))
        .expect("valid response builder")
}

/// Add CORS headers, keeping any the backend already set
fn apply_cors(headers: &mut HeaderMap) {
    for &(name, value) in CORS_HEADERS {
        headers
            .entry(HeaderName::from_static(name))
            .or_insert_with(|| HeaderValue::from_static(value));
    }
}
