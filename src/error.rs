//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors surfaced by the supervisor and proxy layers.
///
/// Network and process failures are mapped to structured responses at the
/// proxy boundary; none of these are fatal to the gateway process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// No credentials, or credentials that failed verification
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),
    /// Verified identity lacks the required privilege
    #[error("not authorized: {0}")]
    AuthorizationFailure(String),
    /// The instance exists but could not be reached
    #[error("instance unavailable: {0}")]
    InstanceUnavailable(String),
    /// A proxied request exceeded its deadline
    #[error("upstream request timed out after {0} seconds")]
    GatewayTimeout(u64),
    /// No free port left in the reserved range
    #[error("no free port in range {0}-{1}")]
    ResourceExhausted(u16, u16),
    /// The worker never became ready within the startup timeout
    #[error("worker for {0} did not become ready within {1} seconds")]
    StartupTimeout(String, u64),
    /// Spawn or signal failure
    #[error("process error: {0}")]
    ProcessError(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationFailure(_) => StatusCode::UNAUTHORIZED,
            GatewayError::AuthorizationFailure(_) => StatusCode::FORBIDDEN,
            GatewayError::InstanceUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ResourceExhausted(_, _) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::StartupTimeout(_, _) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ProcessError(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable code for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayError::AuthenticationFailure(_) => "AUTHENTICATION_FAILURE",
            GatewayError::AuthorizationFailure(_) => "AUTHORIZATION_FAILURE",
            GatewayError::InstanceUnavailable(_) => "INSTANCE_UNAVAILABLE",
            GatewayError::GatewayTimeout(_) => "GATEWAY_TIMEOUT",
            GatewayError::ResourceExhausted(_, _) => "RESOURCE_EXHAUSTED",
            GatewayError::StartupTimeout(_, _) => "STARTUP_TIMEOUT",
            GatewayError::ProcessError(_) => "PROCESS_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: status.as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Body type produced by the proxy for both forwarded and locally-built
/// responses.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Build a JSON error response for a GatewayError
pub fn error_response(err: &GatewayError) -> Response<ProxyBody> {
    json_error_response(err.as_header_value(), err.status_code(), err.to_string())
}

/// Create a JSON error response with an X-Gateway-Error header
pub fn json_error_response(
    code: &'static str,
    status: StatusCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, status, message).to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code)
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
