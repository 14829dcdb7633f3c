//! HTTP surface of the sequencer.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use parley_auth::{bearer_token, JwtManager};
use parley_events::{ConversationId, MessageCreated, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::conversations::{ConversationRepository, MemberRecord};
use crate::error::SequencerResult;
use crate::sender::MessageSender;
use crate::sequencer::Sequencer;

#[derive(Clone)]
pub struct SequencerState {
    pub sequencer: Sequencer,
    pub conversations: ConversationRepository,
    pub tokens: Arc<JwtManager>,
    pub sender: MessageSender,
}

impl SequencerState {
    /// Identify the caller from the `Authorization` header.
    pub fn authenticate(&self, headers: &HeaderMap) -> SequencerResult<UserId> {
        let header = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        let token = bearer_token(header)?;
        Ok(self.tokens.verify(token)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub seq: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub async fn allocate_seq(
    State(state): State<SequencerState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> SequencerResult<Json<AllocateResponse>> {
    let caller = state.authenticate(&headers)?;
    let seq = state
        .sequencer
        .allocate(&ConversationId::from(conversation_id), &caller)
        .await?;
    Ok(Json(AllocateResponse { seq }))
}

pub async fn send_message(
    State(state): State<SequencerState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> SequencerResult<(StatusCode, Json<MessageCreated>)> {
    let caller = state.authenticate(&headers)?;
    let event = state
        .sender
        .send(&ConversationId::from(conversation_id), &caller, &request.body)
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// Service-to-service listing used by the fanout router's membership resolver.
pub async fn list_members(
    State(state): State<SequencerState>,
    Path(conversation_id): Path<String>,
) -> SequencerResult<Json<Vec<MemberRecord>>> {
    let members = state
        .conversations
        .active_members(&ConversationId::from(conversation_id))
        .await?;
    Ok(Json(members))
}

pub fn create_router(state: SequencerState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/conversations/:conversation_id/allocate-seq",
            post(allocate_seq),
        )
        .route("/conversations/:conversation_id/messages", post(send_message))
        .route(
            "/internal/conversations/:conversation_id/members",
            get(list_members),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
