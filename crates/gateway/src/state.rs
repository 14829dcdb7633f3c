//! Shared state for the gateway's HTTP and websocket routes

use axum::http::{header, HeaderMap};
use parley_auth::{bearer_token, JwtManager};
use parley_events::UserId;
use std::sync::Arc;

use crate::connection::ConnectionManager;
use crate::error::GatewayResult;

#[derive(Clone)]
pub struct GatewayState {
    pub connections: Arc<ConnectionManager>,
    pub tokens: Arc<JwtManager>,
}

impl GatewayState {
    pub fn new(connections: Arc<ConnectionManager>, tokens: Arc<JwtManager>) -> Self {
        Self {
            connections,
            tokens,
        }
    }

    /// Identify the user from the upgrade request's `Authorization` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> GatewayResult<UserId> {
        let header = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let token = bearer_token(header)?;
        Ok(self.tokens.verify(token)?)
    }
}
