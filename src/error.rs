//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend has not signalled readiness yet
    ServiceStarting,
    /// Backend unreachable after the retry budget was spent
    BackendUnavailable,
    /// Backend did not start responding within the request ceiling
    GatewayTimeout,
    /// Request body exceeds the replay buffer
    PayloadTooLarge,
    /// Request body could not be read from the client
    BadRequest,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ServiceStarting => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ServiceStarting => "SERVICE_STARTING",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::BadRequest => "BAD_REQUEST",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Short title used as the `error` field of the body
    pub fn title(&self) -> &'static str {
        match self {
            ProxyErrorCode::ServiceStarting => "Service starting",
            ProxyErrorCode::BackendUnavailable => "Backend service unavailable",
            ProxyErrorCode::GatewayTimeout => "Gateway timeout",
            ProxyErrorCode::PayloadTooLarge => "Payload too large",
            ProxyErrorCode::BadRequest => "Bad request",
            ProxyErrorCode::InternalError => "Internal error",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Short error title
    pub error: &'static str,
    /// Human-readable error message
    pub message: String,
    /// The error code
    pub code: ProxyErrorCode,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: code.title(),
            message: message.into(),
            code,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","message":"{}","code":"{}"}}"#,
                self.error,
                self.message.replace('\"', "\\\""),
                self.code.as_header_value()
            )
        })
    }
}

/// Wrap a complete body into the boxed body type used by every handler
pub fn full_body(body: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Service-starting response carrying a `Retry-After` hint
pub fn service_starting_response(retry_after_secs: u64) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = json_error_response(
        ProxyErrorCode::ServiceStarting,
        "Backend is initializing, please retry in a few seconds",
    );
    response
        .headers_mut()
        .insert(hyper::header::RETRY_AFTER, retry_after_secs.into());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::ServiceStarting.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::GatewayTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::PayloadTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::BackendUnavailable, "connection refused");
        let json: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();

        assert_eq!(json["error"], "Backend service unavailable");
        assert_eq!(json["message"], "connection refused");
        assert_eq!(json["code"], "BACKEND_UNAVAILABLE");
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::GatewayTimeout, "Backend request timeout");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "GATEWAY_TIMEOUT"
        );
    }

    #[test]
    fn test_service_starting_has_retry_after() {
        let response = service_starting_response(5);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "5");
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "SERVICE_STARTING"
        );
    }
}
