use crate::types::CallStatus;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// Contract violations reported by the call registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a live session already exists for call {0}")]
    DuplicateSession(String),
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: CallStatus, to: CallStatus },
    #[error("session {0} is still active")]
    SessionStillActive(String),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("a session requires an external call reference")]
    MissingCallRef,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("speech transport error: {0}")]
    Connection(String),
    #[error("speech synthesis failed: {0}")]
    SynthesisFailed(String),
    #[error("audio playback failed: {0}")]
    Playback(String),
    #[error("speech transport timed out")]
    Timeout,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponderError {
    #[error("responder timed out")]
    Timeout,
    #[error("responder failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("telephony request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telephony provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Telephony(#[from] TelephonyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(&'static str),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            AppError::Registry(RegistryError::MissingCallRef) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Registry(_) => StatusCode::CONFLICT,
            AppError::Telephony(_) | AppError::Transport(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error=%self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}
