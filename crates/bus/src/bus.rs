//! Event bus contract.

use async_trait::async_trait;
use parley_events::{ConversationId, Topic};

use crate::error::BusResult;

/// Log position assigned by the bus on publish.
pub type DeliveryId = String;

/// One delivery of a published event to a consumer.
///
/// The same entry may be delivered more than once; `attempt` counts the deliveries
/// this consumer has made of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub topic: Topic,
    pub partition: u32,
    pub partition_key: ConversationId,
    pub payload: String,
    pub attempt: u32,
}

/// Which partition of which topics a consumer reads, and as which group member.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub group: String,
    pub consumer: String,
    pub partition: u32,
    pub topics: Vec<Topic>,
}

impl Subscription {
    pub fn new(group: impl Into<String>, consumer: impl Into<String>, partition: u32) -> Self {
        Self {
            group: group.into(),
            consumer: consumer.into(),
            partition,
            topics: Topic::ALL.to_vec(),
        }
    }

    pub fn with_topics(mut self, topics: impl IntoIterator<Item = Topic>) -> Self {
        self.topics = topics.into_iter().collect();
        self
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    fn partitions(&self) -> u32;

    /// Durably append `payload` to `topic` on the partition owning `partition_key`.
    async fn publish(
        &self,
        topic: Topic,
        partition_key: &ConversationId,
        payload: String,
    ) -> BusResult<DeliveryId>;

    async fn subscribe(&self, subscription: Subscription) -> BusResult<Box<dyn EventConsumer>>;
}

/// A consumer group member bound to one partition.
///
/// Entries are handed out in log order. An entry stays pending until it is acked;
/// pending entries are handed out again after a `nack`, after the consumer is
/// recreated under the same name, or to another group member once they have been
/// idle longer than the redelivery timeout.
#[async_trait]
pub trait EventConsumer: Send {
    /// Wait for the next delivery.
    async fn next(&mut self) -> BusResult<Delivery>;

    async fn ack(&mut self, delivery: &Delivery) -> BusResult<()>;

    /// Give the delivery back. It is the next one handed out by this consumer.
    async fn nack(&mut self, delivery: &Delivery) -> BusResult<()>;
}
