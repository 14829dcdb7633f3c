//! Domain events published on the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::ids::{ConversationId, MessageId, UserId};

/// Maximum number of characters carried in a message preview.
pub const PREVIEW_LENGTH: usize = 200;

/// A message was stored in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCreated {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub seq: i64,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub preview: String,
}

impl MessageCreated {
    /// Build the event for a freshly stored message, cutting the body down to a preview.
    pub fn new(
        conversation_id: ConversationId,
        message_id: MessageId,
        seq: i64,
        sender_id: UserId,
        created_at: DateTime<Utc>,
        body: &str,
    ) -> Self {
        Self {
            conversation_id,
            message_id,
            seq,
            sender_id,
            created_at,
            preview: preview_of(body),
        }
    }
}

/// First [`PREVIEW_LENGTH`] characters of `body`, split on a character boundary.
///
/// ```
/// use parley_events::domain::preview_of;
///
/// assert_eq!(preview_of("hello"), "hello");
/// assert_eq!(preview_of(&"é".repeat(250)).chars().count(), 200);
/// ```
pub fn preview_of(body: &str) -> String {
    body.chars().take(PREVIEW_LENGTH).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationKind {
    #[serde(rename = "DM")]
    Direct,
    #[serde(rename = "GROUP")]
    Group,
}

/// A conversation was created with an initial member set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub member_ids: Vec<UserId>,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// Bus topics. Each [`DomainEvent`] variant lives on exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MessageNew,
    ConversationNew,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::MessageNew, Topic::ConversationNew];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MessageNew => "message.new",
            Topic::ConversationNew => "conversation.new",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = EventDecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "message.new" => Ok(Topic::MessageNew),
            "conversation.new" => Ok(Topic::ConversationNew),
            other => Err(EventDecodeError::UnknownTopic(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("malformed {topic} payload: {source}")]
    Malformed {
        topic: Topic,
        #[source]
        source: serde_json::Error,
    },
}

/// Main domain event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    MessageCreated(MessageCreated),
    ConversationCreated(ConversationCreated),
}

impl DomainEvent {
    /// The conversation the event belongs to; also its partition key.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            DomainEvent::MessageCreated(event) => &event.conversation_id,
            DomainEvent::ConversationCreated(event) => &event.conversation_id,
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            DomainEvent::MessageCreated(_) => Topic::MessageNew,
            DomainEvent::ConversationCreated(_) => Topic::ConversationNew,
        }
    }

    /// The user that caused the event. Never a recipient of its own event.
    pub fn originator(&self) -> &UserId {
        match self {
            DomainEvent::MessageCreated(event) => &event.sender_id,
            DomainEvent::ConversationCreated(event) => &event.created_by,
        }
    }

    /// Get event type name for logging
    pub fn event_type_name(&self) -> &'static str {
        match self {
            DomainEvent::MessageCreated(_) => "message_created",
            DomainEvent::ConversationCreated(_) => "conversation_created",
        }
    }

    /// Wire payload as published on the event's topic.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        match self {
            DomainEvent::MessageCreated(event) => serde_json::to_string(event),
            DomainEvent::ConversationCreated(event) => serde_json::to_string(event),
        }
    }

    pub fn from_payload(topic: Topic, payload: &str) -> Result<Self, EventDecodeError> {
        let malformed = |source| EventDecodeError::Malformed { topic, source };
        match topic {
            Topic::MessageNew => serde_json::from_str(payload)
                .map(DomainEvent::MessageCreated)
                .map_err(malformed),
            Topic::ConversationNew => serde_json::from_str(payload)
                .map(DomainEvent::ConversationCreated)
                .map_err(malformed),
        }
    }
}

impl From<MessageCreated> for DomainEvent {
    fn from(event: MessageCreated) -> Self {
        DomainEvent::MessageCreated(event)
    }
}

impl From<ConversationCreated> for DomainEvent {
    fn from(event: ConversationCreated) -> Self {
        DomainEvent::ConversationCreated(event)
    }
}
