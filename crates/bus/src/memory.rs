//! In-process event bus with the same delivery semantics as the Redis one.

use async_trait::async_trait;
use parley_events::{ConversationId, Topic};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::bus::{Delivery, DeliveryId, EventBus, EventConsumer, Subscription};
use crate::error::{BusError, BusResult};
use crate::partition::partition_for;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Entry {
    seq: u64,
    key: ConversationId,
    payload: String,
}

struct Pending {
    consumer: String,
    topic: Topic,
    partition: u32,
    index: usize,
    attempts: u32,
    delivered_at: Instant,
}

#[derive(Default)]
struct Group {
    cursors: HashMap<(Topic, u32), usize>,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    streams: HashMap<(Topic, u32), Vec<Entry>>,
    groups: HashMap<String, Group>,
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    partitions: u32,
    redelivery_timeout: Duration,
}

#[derive(Clone)]
pub struct MemoryEventBus {
    shared: Arc<Shared>,
}

impl MemoryEventBus {
    pub fn new(partitions: u32) -> Self {
        Self::with_redelivery_timeout(partitions, Duration::from_secs(30))
    }

    pub fn with_redelivery_timeout(partitions: u32, redelivery_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_seq: 1,
                    ..State::default()
                }),
                notify: Notify::new(),
                partitions: partitions.max(1),
                redelivery_timeout,
            }),
        }
    }

    /// Number of entries ever published to one topic partition.
    pub async fn len(&self, topic: Topic, partition: u32) -> usize {
        let state = self.shared.state.lock().await;
        state
            .streams
            .get(&(topic, partition))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Entries handed out to `group` and not yet acknowledged.
    pub async fn pending(&self, group: &str) -> usize {
        let state = self.shared.state.lock().await;
        state
            .groups
            .get(group)
            .map(|group| group.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    fn partitions(&self) -> u32 {
        self.shared.partitions
    }

    async fn publish(
        &self,
        topic: Topic,
        partition_key: &ConversationId,
        payload: String,
    ) -> BusResult<DeliveryId> {
        let partition = partition_for(partition_key.as_str(), self.shared.partitions);
        let id = {
            let mut state = self.shared.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .streams
                .entry((topic, partition))
                .or_default()
                .push(Entry {
                    seq,
                    key: partition_key.clone(),
                    payload,
                });
            entry_id(seq)
        };
        self.shared.notify.notify_waiters();
        Ok(id)
    }

    async fn subscribe(&self, subscription: Subscription) -> BusResult<Box<dyn EventConsumer>> {
        if subscription.partition >= self.shared.partitions {
            return Err(BusError::PartitionOutOfRange {
                partition: subscription.partition,
                partitions: self.shared.partitions,
            });
        }
        if subscription.topics.is_empty() {
            return Err(BusError::EmptySubscription);
        }

        self.shared
            .state
            .lock()
            .await
            .groups
            .entry(subscription.group.clone())
            .or_default();

        Ok(Box::new(MemoryEventConsumer {
            shared: self.shared.clone(),
            subscription,
            recovering: true,
        }))
    }
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn entry_seq(id: &str) -> Option<u64> {
    id.split('-').next().and_then(|seq| seq.parse().ok())
}

struct MemoryEventConsumer {
    shared: Arc<Shared>,
    subscription: Subscription,
    /// Own pending entries are handed out again until none are left.
    recovering: bool,
}

impl MemoryEventConsumer {
    async fn try_next(&mut self) -> Option<Delivery> {
        let now = Instant::now();
        let timeout = self.shared.redelivery_timeout;
        let subscription = &self.subscription;
        let mut state = self.shared.state.lock().await;
        let State {
            streams, groups, ..
        } = &mut *state;
        let group = groups.entry(subscription.group.clone()).or_default();

        let recovering = self.recovering;
        let redeliverable = group.pending.iter_mut().find(|(_, pending)| {
            pending.partition == subscription.partition
                && subscription.topics.contains(&pending.topic)
                && if pending.consumer == subscription.consumer {
                    recovering
                } else {
                    now.duration_since(pending.delivered_at) >= timeout
                }
        });

        if let Some((_, pending)) = redeliverable {
            pending.consumer = subscription.consumer.clone();
            pending.attempts += 1;
            pending.delivered_at = now;
            let entry = &streams[&(pending.topic, pending.partition)][pending.index];
            return Some(Delivery {
                id: entry_id(entry.seq),
                topic: pending.topic,
                partition: pending.partition,
                partition_key: entry.key.clone(),
                payload: entry.payload.clone(),
                attempt: pending.attempts,
            });
        }
        self.recovering = false;

        let (topic, index, entry) = subscription
            .topics
            .iter()
            .filter_map(|topic| {
                let index = group
                    .cursors
                    .get(&(*topic, subscription.partition))
                    .copied()
                    .unwrap_or(0);
                streams
                    .get(&(*topic, subscription.partition))
                    .and_then(|entries| entries.get(index))
                    .map(|entry| (*topic, index, entry))
            })
            .min_by_key(|(_, _, entry)| entry.seq)?;

        group
            .cursors
            .insert((topic, subscription.partition), index + 1);
        group.pending.insert(
            entry.seq,
            Pending {
                consumer: subscription.consumer.clone(),
                topic,
                partition: subscription.partition,
                index,
                attempts: 1,
                delivered_at: now,
            },
        );

        Some(Delivery {
            id: entry_id(entry.seq),
            topic,
            partition: subscription.partition,
            partition_key: entry.key.clone(),
            payload: entry.payload.clone(),
            attempt: 1,
        })
    }
}

#[async_trait]
impl EventConsumer for MemoryEventConsumer {
    async fn next(&mut self) -> BusResult<Delivery> {
        loop {
            let shared = self.shared.clone();
            let notified = shared.notify.notified();
            if let Some(delivery) = self.try_next().await {
                return Ok(delivery);
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> BusResult<()> {
        if let Some(seq) = entry_seq(&delivery.id) {
            let mut state = self.shared.state.lock().await;
            if let Some(group) = state.groups.get_mut(&self.subscription.group) {
                group.pending.remove(&seq);
            }
        }
        Ok(())
    }

    async fn nack(&mut self, _delivery: &Delivery) -> BusResult<()> {
        self.recovering = true;
        Ok(())
    }
}
