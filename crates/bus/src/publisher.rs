use parley_events::DomainEvent;
use std::sync::Arc;
use tracing::debug;

use crate::bus::{DeliveryId, EventBus};
use crate::error::BusResult;

/// Publishes domain events onto their topic, keyed by conversation id.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, event: &DomainEvent) -> BusResult<DeliveryId> {
        let payload = event.to_payload()?;
        let id = self
            .bus
            .publish(event.topic(), event.conversation_id(), payload)
            .await?;
        debug!(
            event_type = event.event_type_name(),
            conversation_id = %event.conversation_id(),
            %id,
            "domain event published"
        );
        Ok(id)
    }
}
