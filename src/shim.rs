//! Local JSON-RPC answers for the RPC endpoint while the backend warms up
//!
//! A client opening an MCP session sends `initialize` first and gives up if
//! it fails. While the backend is not ready the shim answers that handshake
//! itself, accepts notifications, and tells every other call to retry, so the
//! session survives warm-up. The shim never forwards anything.

use crate::config::{ResponseMode, ShimConfig};
use crate::error::full_body;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// JSON-RPC 2.0 parse error
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC 2.0 invalid request
pub const INVALID_REQUEST: i64 = -32600;
/// Server-defined error: backend still initializing
pub const SERVER_INITIALIZING: i64 = -32001;

const NOTIFICATION_PREFIX: &str = "notifications/";

/// Inbound JSON-RPC envelope, parsed only to classify the call
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope {
    pub jsonrpc: String,
    pub method: String,
    /// `null` and absent are both treated as a notification
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

/// What the shim should do with a parsed envelope
#[derive(Debug, Clone, PartialEq)]
pub enum RpcCall {
    /// Session handshake
    Initialize { id: Value },
    /// Fire-and-forget message, needs no reply
    Notification { method: String },
    /// Any other request, which only the backend can answer
    Other { id: Value, method: String },
}

impl RpcEnvelope {
    pub fn classify(self) -> RpcCall {
        match self.id {
            None => RpcCall::Notification { method: self.method },
            Some(_) if self.method.starts_with(NOTIFICATION_PREFIX) => {
                RpcCall::Notification { method: self.method }
            }
            Some(id) if self.method == "initialize" => RpcCall::Initialize { id },
            Some(id) => RpcCall::Other { id, method: self.method },
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcError<'a> {
    code: i64,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct RpcResponse<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError<'a>>,
}

impl<'a> RpcResponse<'a> {
    fn result(id: &'a Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: &'a Value, code: i64, message: &'a str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
                .to_string()
        })
    }
}

/// Why a body could not be read as an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Not JSON at all
    Parse(String),
    /// JSON, but not a JSON-RPC 2.0 request object
    Invalid(String),
}

/// Parse a request body into an envelope
pub fn parse_envelope(body: &[u8]) -> Result<RpcEnvelope, EnvelopeError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| EnvelopeError::Parse(e.to_string()))?;

    if !value.is_object() {
        return Err(EnvelopeError::Invalid(
            "expected a single JSON-RPC request object".to_string(),
        ));
    }

    // No id means no reply is owed, so the rest of the envelope is not checked
    if value.get("id").map_or(true, Value::is_null) {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        return Ok(RpcEnvelope {
            jsonrpc: field("jsonrpc"),
            method: field("method"),
            id: None,
            params: value.get("params").cloned(),
        });
    }

    let envelope: RpcEnvelope =
        serde_json::from_value(value).map_err(|e| EnvelopeError::Invalid(e.to_string()))?;

    if envelope.jsonrpc != "2.0" {
        return Err(EnvelopeError::Invalid(format!(
            "unsupported jsonrpc version '{}'",
            envelope.jsonrpc
        )));
    }

    Ok(envelope)
}

/// Answers RPC calls on behalf of a backend that is not ready yet
pub struct ProtocolShim {
    config: ShimConfig,
    retry_after_secs: u64,
}

impl ProtocolShim {
    pub fn new(config: ShimConfig, retry_after_secs: u64) -> Self {
        Self {
            config,
            retry_after_secs,
        }
    }

    /// Synthetic `initialize` result
    pub fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {
                "tools": {},
                "resources": {},
                "prompts": {},
            },
            "serverInfo": {
                "name": self.config.server_name,
                "version": self.config.server_version,
            },
            "instructions": self.config.instructions,
        })
    }

    /// Buffer the body (bounded) and answer locally
    pub async fn respond<B>(&self, headers: &HeaderMap, body: B) -> Response<BoxBody<Bytes, hyper::Error>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(body, self.config.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                warn!(limit = self.config.max_body_bytes, "Rejected oversized RPC body during warm-up");
                return self.rpc_error_status(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    INVALID_REQUEST,
                    "Request body too large",
                );
            }
            Err(e) => {
                debug!(error = %e, "Failed to read RPC body during warm-up");
                return self.rpc_error_status(
                    StatusCode::BAD_REQUEST,
                    INVALID_REQUEST,
                    "Request body could not be read",
                );
            }
        };

        self.respond_to_bytes(headers, &bytes)
    }

    /// Answer an already buffered body
    pub fn respond_to_bytes(&self, headers: &HeaderMap, body: &[u8]) -> Response<BoxBody<Bytes, hyper::Error>> {
        let envelope = match parse_envelope(body) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::Parse(detail)) => {
                debug!(detail, "Malformed RPC body during warm-up");
                return self.rpc_error_status(StatusCode::BAD_REQUEST, PARSE_ERROR, "Parse error");
            }
            Err(EnvelopeError::Invalid(detail)) => {
                debug!(detail, "Invalid RPC envelope during warm-up");
                return self.rpc_error_status(StatusCode::BAD_REQUEST, INVALID_REQUEST, "Invalid Request");
            }
        };

        let sse = self.wants_sse(headers);

        match envelope.classify() {
            RpcCall::Initialize { id } => {
                debug!(%id, "Answering initialize locally while backend starts");
                let body = RpcResponse::result(&id, self.initialize_result()).to_json();
                framed(StatusCode::OK, sse, body)
            }
            RpcCall::Notification { method } => {
                debug!(method, "Accepted notification while backend starts");
                Response::builder()
                    .status(StatusCode::ACCEPTED)
                    .body(full_body(Bytes::new()))
                    .expect("valid response with StatusCode enum")
            }
            RpcCall::Other { id, method } => {
                debug!(method, %id, "Deferring RPC call until backend is ready");
                let body = RpcResponse::error(
                    &id,
                    SERVER_INITIALIZING,
                    "Server is initializing, please retry shortly",
                )
                .to_json();
                let mut response = framed(StatusCode::OK, sse, body);
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, self.retry_after_secs.into());
                response
            }
        }
    }

    fn wants_sse(&self, headers: &HeaderMap) -> bool {
        match self.config.response_mode {
            ResponseMode::Json => false,
            ResponseMode::Sse => true,
            ResponseMode::Auto => headers
                .get_all(ACCEPT)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .any(|v| v.contains("text/event-stream")),
        }
    }

    fn rpc_error_status(&self, status: StatusCode, code: i64, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let body = RpcResponse::error(&Value::Null, code, message).to_json();
        framed(status, false, body)
    }
}

/// Frame a JSON-RPC message as a plain body or as a single SSE event
fn framed(status: StatusCode, sse: bool, json: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (content_type, body) = if sse {
        ("text/event-stream", format!("event: message\ndata: {}\n\n", json))
    } else {
        ("application/json", json)
    };

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header("Cache-Control", "no-cache")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
