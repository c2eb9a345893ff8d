use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::JobStatus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("export job {0} not found")]
    NotFound(String),

    #[error("export job {0} is already terminal")]
    Terminal(String),

    #[error("export job {0} is already running")]
    Claimed(String),

    #[error("export job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("export job {id} patch rejected: {reason}")]
    InvalidPatch { id: String, reason: &'static str },
}

impl StoreError {
    pub fn transition(id: &str, from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidTransition {
            id: id.to_string(),
            from: from.as_str(),
            to: to.as_str(),
        }
    }
}

/// Errors surfaced by HTTP handlers. The tag is the only detail a caller sees.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid payload")]
    InvalidPayload,

    #[error("missing job id")]
    MissingJobId,

    #[error("not found")]
    NotFound,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid token")]
    InvalidToken,

    #[error("webhook error: {0:#}")]
    Webhook(anyhow::Error),

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPayload | Self::MissingJobId => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            Self::InvalidToken => StatusCode::FORBIDDEN,
            Self::Webhook(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::MissingJobId => "missing_jobId",
            Self::NotFound => "not_found",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidToken => "invalid_token",
            Self::Webhook(_) => "webhook_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Webhook(_) | Self::Internal(_)) {
            tracing::error!("{self}");
        }

        (
            self.status_code(),
            Json(json!({ "ok": false, "error": self.tag() })),
        )
            .into_response()
    }
}
