//! Websocket frames. Every frame is `{"event": name, "data": payload}`.

use chrono::Utc;
use parley_events::{ConversationCreated, GatewayId, MessageCreated, PushEvent, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Frames sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected {
        user_id: UserId,
        gateway_id: GatewayId,
        timestamp: String,
    },
    #[serde(rename = "pong")]
    Pong { timestamp: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "message.new")]
    MessageNew(MessageCreated),
    #[serde(rename = "conversation.new")]
    ConversationNew(ConversationCreated),
}

impl ServerEvent {
    pub fn connected(user_id: UserId, gateway_id: GatewayId) -> Self {
        ServerEvent::Connected {
            user_id,
            gateway_id,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn pong() -> Self {
        ServerEvent::Pong {
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_frame(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<PushEvent> for ServerEvent {
    fn from(push: PushEvent) -> Self {
        match push {
            PushEvent::MessageNew(event) => ServerEvent::MessageNew(event),
            PushEvent::ConversationNew(event) => ServerEvent::ConversationNew(event),
        }
    }
}

/// Frames accepted from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    Ping,
}

#[derive(Deserialize)]
struct RawClientFrame {
    event: String,
}

impl ClientEvent {
    /// Parse a text frame. Any `data` sent along with a ping is ignored.
    pub fn parse(text: &str) -> GatewayResult<Self> {
        let frame: RawClientFrame = serde_json::from_str(text)?;
        match frame.event.as_str() {
            "ping" => Ok(ClientEvent::Ping),
            other => Err(GatewayError::InvalidFrame(format!("unknown event: {other}"))),
        }
    }
}
