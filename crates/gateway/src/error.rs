//! Error types for the gateway layer

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_auth::AuthError;
use parley_bus::BusError;
use parley_presence::PresenceError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[from] AuthError),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("presence registry error: {0}")]
    Presence(#[from] PresenceError),

    #[error("gateway channel error: {0}")]
    Channel(#[from] BusError),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidFrame(_) => StatusCode::BAD_REQUEST,
            GatewayError::Presence(_) | GatewayError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::WebSocket(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = json!({
            "error": status.as_str(),
            "message": self.to_string(),
        });

        (status, Json(error_response)).into_response()
    }
}

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

impl From<serde_json::Error> for GatewayError {
    fn from(error: serde_json::Error) -> Self {
        GatewayError::InvalidFrame(error.to_string())
    }
}

impl From<axum::Error> for GatewayError {
    fn from(error: axum::Error) -> Self {
        GatewayError::WebSocket(error.to_string())
    }
}
