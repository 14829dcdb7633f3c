//! Envelopes carried on a gateway's private channel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ConversationCreated, DomainEvent, MessageCreated};
use crate::ids::UserId;

/// An event pushed to a client socket. Serializes as `{"event": name, "data": payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    #[serde(rename = "message.new")]
    MessageNew(MessageCreated),
    #[serde(rename = "conversation.new")]
    ConversationNew(ConversationCreated),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::MessageNew(_) => "message.new",
            PushEvent::ConversationNew(_) => "conversation.new",
        }
    }
}

impl From<DomainEvent> for PushEvent {
    fn from(event: DomainEvent) -> Self {
        match event {
            DomainEvent::MessageCreated(event) => PushEvent::MessageNew(event),
            DomainEvent::ConversationCreated(event) => PushEvent::ConversationNew(event),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// `{userId, event, data}`: one recipient's copy of a push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct GatewayEnvelope {
    pub user_id: UserId,
    pub push: PushEvent,
}

impl GatewayEnvelope {
    pub fn new(user_id: UserId, push: PushEvent) -> Self {
        Self { user_id, push }
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "userId")]
    user_id: UserId,
    event: String,
    data: serde_json::Value,
}

impl TryFrom<RawEnvelope> for GatewayEnvelope {
    type Error = EnvelopeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let push = match raw.event.as_str() {
            "message.new" => PushEvent::MessageNew(serde_json::from_value(raw.data)?),
            "conversation.new" => PushEvent::ConversationNew(serde_json::from_value(raw.data)?),
            _ => return Err(EnvelopeError::UnknownEvent(raw.event)),
        };
        Ok(Self {
            user_id: raw.user_id,
            push,
        })
    }
}

impl From<GatewayEnvelope> for RawEnvelope {
    fn from(envelope: GatewayEnvelope) -> Self {
        let event = envelope.push.name().to_string();
        let data = match envelope.push {
            PushEvent::MessageNew(event) => serde_json::to_value(event),
            PushEvent::ConversationNew(event) => serde_json::to_value(event),
        }
        // Both payloads are plain structs of strings and integers.
        .unwrap_or(serde_json::Value::Null);
        Self {
            user_id: envelope.user_id,
            event,
            data,
        }
    }
}
