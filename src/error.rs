use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::sandbox::SandboxError;

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("execution queue is full")]
    QueueFull,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match self {
            EngineError::Unauthorized => StatusCode::UNAUTHORIZED,
            EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

/// Metric bucket for a whole-batch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    UnsupportedLanguage,
    SandboxTransportError,
    SandboxOutputError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedLanguage => "UnsupportedLanguage",
            ErrorKind::SandboxTransportError => "SandboxTransportError",
            ErrorKind::SandboxOutputError => "SandboxOutputError",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// A failure that invalidates every input of an execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("execution aborted: {0}")]
    Internal(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            ExecutionError::Sandbox(SandboxError::Transport(_)) => {
                ErrorKind::SandboxTransportError
            }
            ExecutionError::Sandbox(SandboxError::Output(_)) => ErrorKind::SandboxOutputError,
            ExecutionError::Internal(_) => ErrorKind::Internal,
        }
    }
}
