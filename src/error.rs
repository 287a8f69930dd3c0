//! Error handling and JSON error responses for served requests

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::config::MIN_PORT;

/// Error from the port prober. Ordinary bind failures are not errors;
/// only malformed input is.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("port {0} is below the allowed minimum {MIN_PORT}")]
    PortOutOfRange(u16),
}

/// Error from the directory-config store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read store file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write store file: {0}")]
    Write(#[source] std::io::Error),

    #[error("store file is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("no directory registered with id '{0}'")]
    UnknownId(String),
}

/// Error codes for request-level failures in a static server instance
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServeErrorCode {
    /// Requested path does not resolve to a servable file
    NotFound,
    /// Requested path escapes the served root
    ForbiddenPath,
    /// Method other than GET/HEAD on a static path
    MethodNotAllowed,
    /// Failed to connect to the proxy upstream
    UpstreamConnectFailed,
    /// Proxy upstream did not respond in time
    UpstreamTimeout,
    /// Internal serving error
    InternalError,
}

impl ServeErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeErrorCode::NotFound => StatusCode::NOT_FOUND,
            ServeErrorCode::ForbiddenPath => StatusCode::FORBIDDEN,
            ServeErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServeErrorCode::UpstreamConnectFailed => StatusCode::BAD_GATEWAY,
            ServeErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ServeErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Serve-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ServeErrorCode::NotFound => "NOT_FOUND",
            ServeErrorCode::ForbiddenPath => "FORBIDDEN_PATH",
            ServeErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ServeErrorCode::UpstreamConnectFailed => "UPSTREAM_CONNECT_FAILED",
            ServeErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ServeErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ServeErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ServeErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Serve-Error header
pub fn json_error_response(
    code: ServeErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Serve-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ServeErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServeErrorCode::ForbiddenPath.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ServeErrorCode::UpstreamConnectFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServeErrorCode::UpstreamTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ServeErrorCode::NotFound, "no such file: /missing.js");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NOT_FOUND\""));
        assert!(json.contains("\"message\":\"no such file: /missing.js\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response =
            json_error_response(ServeErrorCode::UpstreamTimeout, "upstream did not respond");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Serve-Error").unwrap(),
            "UPSTREAM_TIMEOUT"
        );
    }

    #[test]
    fn test_probe_error_display() {
        let err = ProbeError::PortOutOfRange(80);
        assert!(err.to_string().contains("80"));
        assert!(err.to_string().contains("1024"));
    }
}
