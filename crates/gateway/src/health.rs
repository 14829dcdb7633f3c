use axum::{extract::State, Json};
use chrono::Utc;
use parley_events::GatewayId;
use serde::Serialize;

use crate::state::GatewayState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub gateway_id: GatewayId,
    pub active_connections: usize,
    pub timestamp: String,
}

pub async fn health_check(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        gateway_id: state.connections.gateway_id().clone(),
        active_connections: state.connections.active_connections().await,
        timestamp: Utc::now().to_rfc3339(),
    })
}
