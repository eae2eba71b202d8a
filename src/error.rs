#![forbid(unsafe_code)]

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::engine::EngineError;

/// Failure taxonomy for room, transport, and broker operations. Every
/// variant is recoverable and scoped to the request that raised it; worker
/// death (handled in the binary) is the only process-fatal condition.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    IncompatibleMedia(String),
    #[error("media engine failure: {0}")]
    Engine(#[from] EngineError),
}

pub type SignalResult<T> = Result<T, SignalError>;

impl SignalError {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalError::Validation(_) => "validation",
            SignalError::Conflict(_) => "conflict",
            SignalError::NotFound(_) => "not-found",
            SignalError::IncompatibleMedia(_) => "incompatible-media",
            SignalError::Engine(_) => "engine",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SignalError::Validation(_) => StatusCode::BAD_REQUEST,
            SignalError::Conflict(_) => StatusCode::CONFLICT,
            SignalError::NotFound(_) => StatusCode::NOT_FOUND,
            SignalError::IncompatibleMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            SignalError::Engine(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
