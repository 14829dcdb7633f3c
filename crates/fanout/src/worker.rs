//! Bus consumer loops, one per owned partition.

use parley_bus::{Delivery, EventBus, EventConsumer, Subscription};
use parley_config::FanoutConfig;
use parley_events::DomainEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::FanoutResult;
use crate::router::{FanoutReport, FanoutRouter};

const RETRY_BACKOFF: Duration = Duration::from_millis(250);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// How one delivery was settled with the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Routed and acked.
    Routed(FanoutReport),
    /// Acked without routing: malformed, or given up on.
    Dropped,
    /// Handed back to the bus; the partition waits `backoff` before reading on.
    Retry { backoff: Duration },
}

/// Reads one partition and routes its events strictly in order.
pub struct PartitionWorker {
    router: Arc<FanoutRouter>,
    consumer: Box<dyn EventConsumer>,
    partition: u32,
    max_attempts: u32,
    retry_backoff: Duration,
    max_retry_backoff: Duration,
}

impl PartitionWorker {
    pub fn new(
        router: Arc<FanoutRouter>,
        consumer: Box<dyn EventConsumer>,
        partition: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            router,
            consumer,
            partition,
            max_attempts: max_attempts.max(1),
            retry_backoff: RETRY_BACKOFF,
            max_retry_backoff: MAX_RETRY_BACKOFF,
        }
    }

    /// Initial wait after a failed event and its cap; the wait doubles per attempt.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_backoff = initial;
        self.max_retry_backoff = max.max(initial);
        self
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> FanoutResult<()> {
        info!(partition = self.partition, "partition worker started");
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.consumer.next() => next,
            };

            let pause = match next {
                Ok(delivery) => match self.process(delivery).await {
                    Settlement::Retry { backoff } => backoff,
                    Settlement::Routed(_) | Settlement::Dropped => continue,
                },
                Err(error) if error.is_transient() => {
                    warn!(partition = self.partition, %error, "bus read failed");
                    self.retry_backoff
                }
                Err(error) => {
                    error!(partition = self.partition, %error, "partition worker stopped");
                    return Err(error.into());
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!(partition = self.partition, "partition worker stopped");
        Ok(())
    }

    /// Route one delivery and settle it with the bus.
    ///
    /// Transient failures (membership service down, every gateway unreachable)
    /// are handed back to the bus however often they repeat. Only failures that
    /// retrying cannot fix are given up on after `max_attempts` deliveries.
    pub async fn process(&mut self, delivery: Delivery) -> Settlement {
        let event = match DomainEvent::from_payload(delivery.topic, &delivery.payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(
                    partition = self.partition,
                    delivery_id = %delivery.id,
                    %error,
                    "malformed event dropped"
                );
                self.ack(&delivery).await;
                return Settlement::Dropped;
            }
        };

        match self.router.handle(&event).await {
            Ok(report) => {
                info!(
                    partition = self.partition,
                    conversation_id = %event.conversation_id(),
                    event_type = event.event_type_name(),
                    recipients = report.recipients,
                    delivered = report.delivered,
                    offline = report.offline,
                    failed = report.failed,
                    "event routed"
                );
                self.ack(&delivery).await;
                Settlement::Routed(report)
            }
            Err(routing_error)
                if !routing_error.is_transient() && delivery.attempt >= self.max_attempts =>
            {
                error!(
                    partition = self.partition,
                    conversation_id = %event.conversation_id(),
                    event_type = event.event_type_name(),
                    delivery_id = %delivery.id,
                    attempt = delivery.attempt,
                    error = %routing_error,
                    "giving up on event"
                );
                self.ack(&delivery).await;
                Settlement::Dropped
            }
            Err(routing_error) => {
                let backoff = retry_delay(self.retry_backoff, self.max_retry_backoff, delivery.attempt);
                warn!(
                    partition = self.partition,
                    conversation_id = %event.conversation_id(),
                    delivery_id = %delivery.id,
                    attempt = delivery.attempt,
                    transient = routing_error.is_transient(),
                    backoff_ms = backoff.as_millis() as u64,
                    error = %routing_error,
                    "event routing failed, will be redelivered"
                );
                if let Err(error) = self.consumer.nack(&delivery).await {
                    warn!(partition = self.partition, %error, "nack failed");
                }
                Settlement::Retry { backoff }
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) {
        // An unacked entry is redelivered later, which consumers tolerate.
        if let Err(error) = self.consumer.ack(delivery).await {
            warn!(partition = self.partition, delivery_id = %delivery.id, %error, "ack failed");
        }
    }
}

/// Wait after the `attempt`-th failed delivery of an event: doubles per attempt up to `max`.
fn retry_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    initial.saturating_mul(1 << exponent).min(max)
}

/// Subscribe to every partition this instance owns and start a worker on each.
pub async fn spawn_partition_workers(
    bus: Arc<dyn EventBus>,
    router: Arc<FanoutRouter>,
    config: &FanoutConfig,
    shutdown: CancellationToken,
) -> FanoutResult<Vec<JoinHandle<FanoutResult<()>>>> {
    let partitions = config.owned_partitions(bus.partitions());
    info!(
        instance_index = config.instance_index,
        instance_count = config.instance_count,
        ?partitions,
        "starting fanout workers"
    );

    let mut handles = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let consumer = bus
            .subscribe(Subscription::new(
                config.consumer_group.clone(),
                config.consumer_name.clone(),
                partition,
            ))
            .await?;
        let worker = PartitionWorker::new(
            router.clone(),
            consumer,
            partition,
            config.max_delivery_attempts,
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_up_to_the_cap() {
        let initial = Duration::from_millis(250);
        let max = Duration::from_secs(10);

        assert_eq!(retry_delay(initial, max, 0), initial);
        assert_eq!(retry_delay(initial, max, 1), initial);
        assert_eq!(retry_delay(initial, max, 2), Duration::from_millis(500));
        assert_eq!(retry_delay(initial, max, 3), Duration::from_secs(1));
        assert_eq!(retry_delay(initial, max, 6), Duration::from_secs(8));
        assert_eq!(retry_delay(initial, max, 7), max);
        assert_eq!(retry_delay(initial, max, u32::MAX), max);
    }
}
