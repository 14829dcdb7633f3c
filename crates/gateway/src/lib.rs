//! # Parley Gateway
//!
//! Terminates client websockets for one gateway instance.
//!
//! - **Connections**: the local socket table, presence registration and heartbeat
//! - **Forwarder**: pushes envelopes from this gateway's private channel to local sockets
//! - **Routes**: `GET /ws` (bearer token in the `Authorization` header) and `GET /health`

pub mod connection;
pub mod error;
pub mod events;
pub mod health;
pub mod state;
pub mod websocket;

pub use connection::{Connection, ConnectionId, ConnectionManager, HeartbeatReport};
pub use error::{GatewayError, GatewayResult};
pub use events::{ClientEvent, ServerEvent};
pub use state::GatewayState;

use axum::{http::Method, routing::get, Router};
use parley_bus::GatewayChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(health::health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the heartbeat loop and the private channel forwarder.
pub fn spawn_background_tasks(
    connections: Arc<ConnectionManager>,
    channel: Arc<dyn GatewayChannel>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(
            connections
                .clone()
                .run_heartbeat(heartbeat_interval, shutdown.clone()),
        ),
        tokio::spawn(connections.run_forwarder(channel, shutdown)),
    ]
}
