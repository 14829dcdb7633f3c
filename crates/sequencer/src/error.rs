//! Error types for the sequencer service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_auth::AuthError;
use parley_bus::BusError;
use parley_events::{ConversationId, UserId};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("user {user_id} is not a member of conversation {conversation_id}")]
    Forbidden {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("event publish failed: {0}")]
    Publish(#[from] BusError),

    #[error("message store failed: {0}")]
    Store(String),
}

impl SequencerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SequencerError::NotFound(_) => StatusCode::NOT_FOUND,
            SequencerError::Forbidden { .. } => StatusCode::FORBIDDEN,
            SequencerError::Validation(_) => StatusCode::BAD_REQUEST,
            SequencerError::Auth(_) => StatusCode::UNAUTHORIZED,
            SequencerError::Database(_) | SequencerError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SequencerError::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SequencerError::Database(_) | SequencerError::Publish(_) | SequencerError::Store(_)
        )
    }
}

impl IntoResponse for SequencerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = json!({
            "error": status.as_str(),
            "message": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

pub type SequencerResult<T> = Result<T, SequencerError>;
