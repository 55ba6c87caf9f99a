//! Stable, client-visible error codes.
//!
//! Every error a client can observe from the gateway itself (as opposed to an error proxied
//! verbatim from a backend) is a [`GatewayError`]. It renders as `{"code": .., "message": ..}`
//! with the mapped HTTP status. The optional `detail` never leaves the process: it travels in
//! the response extensions so the `errorhandler` middleware can log it.
use std::fmt;

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Numeric code, HTTP status and public message of one error class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    pub code: u32,
    pub status: StatusCode,
    pub message: &'static str,
}

impl ErrorCode {
    pub const UPSTREAM_NOT_INIT: Self = Self {
        code: 1000,
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "balancer not init",
    };
    pub const INTERNAL_SERVER_ERROR: Self = Self {
        code: 1001,
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: "Internal server error",
    };
    pub const BACKEND_TIMEOUT: Self = Self {
        code: 1002,
        status: StatusCode::GATEWAY_TIMEOUT,
        message: "Backend timeout",
    };
    pub const ROUTE_NOT_FOUND: Self = Self {
        code: 1003,
        status: StatusCode::NOT_FOUND,
        message: "Route not found",
    };
    pub const METHOD_NOT_ALLOWED: Self = Self {
        code: 1004,
        status: StatusCode::METHOD_NOT_ALLOWED,
        message: "Method not allowed",
    };
    pub const UPGRADE_NOT_SUPPORTED: Self = Self {
        code: 1005,
        status: StatusCode::NOT_IMPLEMENTED,
        message: "Protocol upgrade not supported",
    };
    pub const NO_UPSTREAM: Self = Self {
        code: 1006,
        status: StatusCode::SERVICE_UNAVAILABLE,
        message: "No available upstream",
    };
    pub const PAYLOAD_TOO_LARGE: Self = Self {
        code: 1007,
        status: StatusCode::PAYLOAD_TOO_LARGE,
        message: "Request body too large",
    };
}

/// Wire shape of a gateway error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub message: String,
}

/// An error produced by the gateway on the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub code: ErrorCode,
    /// Internal description, logged but never returned to clients
    pub detail: Option<String>,
}

impl GatewayError {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::with_detail(ErrorCode::INTERNAL_SERVER_ERROR, detail)
    }

    pub fn status(&self) -> StatusCode {
        self.code.status
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code.code,
            message: self.code.message.to_string(),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code, self.code.message)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        response.extensions_mut().insert(self);
        response
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_error_renders_code_and_message_only() {
        let err = GatewayError::with_detail(ErrorCode::BACKEND_TIMEOUT, "10.0.0.1:80 stalled");
        let response = err.clone().into_response();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.extensions().get::<GatewayError>(), Some(&err));

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body,
            ErrorBody {
                code: 1002,
                message: "Backend timeout".to_string()
            }
        );
        assert!(!String::from_utf8_lossy(&bytes).contains("stalled"));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = GatewayError::internal("boom");
        assert_eq!(err.to_string(), "[1001] Internal server error: boom");
    }
}
