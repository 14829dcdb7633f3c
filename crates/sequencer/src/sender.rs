//! Store-then-publish path for new messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_bus::{DeliveryId, EventPublisher};
use parley_events::{
    ConversationCreated, ConversationId, DomainEvent, MessageCreated, MessageId, UserId,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{SequencerError, SequencerResult};
use crate::sequencer::Sequencer;

pub const MAX_BODY_CHARS: usize = 10_000;

/// A message as handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub seq: i64,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

/// Persists full message bodies. Owned by the message service.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn put(&self, message: &StoredMessage) -> SequencerResult<()>;
}

/// Discards bodies, for deployments where the message service stores them itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMessageStore;

#[async_trait]
impl MessageStore for NoopMessageStore {
    async fn put(&self, _message: &StoredMessage) -> SequencerResult<()> {
        Ok(())
    }
}

fn validate_body(body: &str) -> SequencerResult<()> {
    if body.trim().is_empty() {
        return Err(SequencerError::Validation(
            "message body must not be empty".to_string(),
        ));
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(SequencerError::Validation(format!(
            "message body exceeds {MAX_BODY_CHARS} characters"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct MessageSender {
    sequencer: Sequencer,
    store: Arc<dyn MessageStore>,
    publisher: EventPublisher,
}

impl MessageSender {
    pub fn new(sequencer: Sequencer, store: Arc<dyn MessageStore>, publisher: EventPublisher) -> Self {
        Self {
            sequencer,
            store,
            publisher,
        }
    }

    /// Allocate a sequence number for the message, store it and publish
    /// `MessageCreated`.
    ///
    /// A store or publish failure after allocation leaves a gap in the
    /// conversation's sequence; the number is not reused.
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        body: &str,
    ) -> SequencerResult<MessageCreated> {
        validate_body(body)?;

        let seq = self.sequencer.allocate(conversation_id, sender_id).await?;
        let message = StoredMessage {
            conversation_id: conversation_id.clone(),
            message_id: MessageId::generate(),
            seq,
            sender_id: sender_id.clone(),
            created_at: Utc::now(),
            body: body.to_string(),
        };

        if let Err(error) = self.store.put(&message).await {
            warn!(conversation_id = %conversation_id, seq, %error, "message store failed, sequence left unused");
            return Err(error);
        }

        let event = MessageCreated::new(
            message.conversation_id,
            message.message_id,
            message.seq,
            message.sender_id,
            message.created_at,
            &message.body,
        );
        let id = self.publish(&event.clone().into()).await?;

        info!(
            conversation_id = %event.conversation_id,
            message_id = %event.message_id,
            seq = event.seq,
            delivery_id = %id,
            "message published"
        );
        Ok(event)
    }

    pub async fn publish_conversation_created(
        &self,
        event: &ConversationCreated,
    ) -> SequencerResult<DeliveryId> {
        self.publish(&event.clone().into()).await
    }

    async fn publish(&self, event: &DomainEvent) -> SequencerResult<DeliveryId> {
        self.publisher.publish(event).await.map_err(|error| {
            warn!(
                conversation_id = %event.conversation_id(),
                event_type = event.event_type_name(),
                %error,
                "event publish failed"
            );
            SequencerError::from(error)
        })
    }
}
