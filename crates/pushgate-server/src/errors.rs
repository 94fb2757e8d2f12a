//! Error types for startup, serving and HTTP handlers.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Invalid server configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A route path is empty or does not start with `/`.
    #[error("invalid {name} path {path:?}: must be non-empty and start with '/'")]
    InvalidPath {
        /// Which setting (`ws` or `send`).
        name: &'static str,
        /// The rejected value.
        path: String,
    },
    /// Ingress and dispatch share a path.
    #[error("ws path and send path must differ (both {0:?})")]
    DuplicatePath(String),
    /// A path collides with a built-in route.
    #[error("path {0:?} is reserved")]
    ReservedPath(String),
    /// Any other out-of-range value.
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
}

/// Failure starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Binding or serving failed.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request.
    #[error("{0}")]
    BadRequest(String),
    /// Request refused by policy.
    #[error("{0}")]
    Forbidden(String),
    /// Server at capacity.
    #[error("{0}")]
    ServiceUnavailable(String),
}

impl ApiError {
    /// Build a [`ApiError::BadRequest`].
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Build a [`ApiError::Forbidden`].
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    /// Build a [`ApiError::ServiceUnavailable`].
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if matches!(self, Self::ServiceUnavailable(_)) {
            warn!(error_code = code, message = %message, "service unavailable");
        } else {
            debug!(error_code = code, message = %message, "client error");
        }

        let body = ErrorBody {
            error: ErrorDetail { code, message },
        };
        (status, Json(body)).into_response()
    }
}
