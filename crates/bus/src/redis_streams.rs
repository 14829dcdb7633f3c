//! Event bus on Redis Streams.
//!
//! Every partition is one stream, `bus:{partition}`, whose entries carry the
//! topic, the partition key and the JSON payload. All topics of a partition share
//! the stream so events of one conversation are read back in publish order,
//! whatever their topic. Consumers are members of a Redis consumer group. A
//! consumer first re-reads its own pending entries (ids from `0`), then blocks on
//! new ones (`>`), and periodically claims entries that other members left idle
//! past the redelivery timeout.

use async_trait::async_trait;
use parley_config::BusConfig;
use parley_events::{ConversationId, Topic};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, FromRedisValue};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{Delivery, DeliveryId, EventBus, EventConsumer, Subscription};
use crate::error::{BusError, BusResult};
use crate::partition::partition_for;

const TOPIC_FIELD: &str = "topic";
const KEY_FIELD: &str = "key";
const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub partitions: u32,
    pub max_len: usize,
    pub block: Duration,
    pub batch_size: usize,
    pub redelivery_timeout: Duration,
}

impl From<&BusConfig> for StreamOptions {
    fn from(config: &BusConfig) -> Self {
        Self {
            partitions: config.partitions.max(1),
            max_len: config.stream_max_len,
            block: Duration::from_millis(config.block_ms),
            batch_size: config.batch_size.max(1),
            redelivery_timeout: config.redelivery_timeout(),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

/// Stream holding every topic's entries for one partition.
///
/// ```
/// use parley_bus::redis_streams::stream_key;
///
/// assert_eq!(stream_key(3), "bus:3");
/// ```
pub fn stream_key(partition: u32) -> String {
    format!("bus:{partition}")
}

#[derive(Clone)]
pub struct RedisEventBus {
    client: redis::Client,
    conn: ConnectionManager,
    options: StreamOptions,
}

impl RedisEventBus {
    pub async fn connect(client: redis::Client, options: StreamOptions) -> BusResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            options,
        })
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    fn partitions(&self) -> u32 {
        self.options.partitions
    }

    async fn publish(
        &self,
        topic: Topic,
        partition_key: &ConversationId,
        payload: String,
    ) -> BusResult<DeliveryId> {
        let partition = partition_for(partition_key.as_str(), self.options.partitions);
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                stream_key(partition),
                StreamMaxlen::Approx(self.options.max_len),
                "*",
                &[
                    (TOPIC_FIELD, topic.as_str()),
                    (KEY_FIELD, partition_key.as_str()),
                    (PAYLOAD_FIELD, payload.as_str()),
                ],
            )
            .await?;
        debug!(%topic, partition, conversation_id = %partition_key, %id, "event appended");
        Ok(id)
    }

    async fn subscribe(&self, subscription: Subscription) -> BusResult<Box<dyn EventConsumer>> {
        if subscription.partition >= self.options.partitions {
            return Err(BusError::PartitionOutOfRange {
                partition: subscription.partition,
                partitions: self.options.partitions,
            });
        }
        if subscription.topics.is_empty() {
            return Err(BusError::EmptySubscription);
        }

        // Blocking reads would stall every other user of a shared connection.
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = stream_key(subscription.partition);
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&key, &subscription.group, "0").await;
        match created {
            Ok(()) => info!(stream = %key, group = %subscription.group, "consumer group created"),
            Err(error) if error.code() == Some("BUSYGROUP") => {}
            Err(error) => return Err(error.into()),
        }

        Ok(Box::new(RedisEventConsumer {
            conn,
            key,
            subscription,
            options: self.options.clone(),
            buffer: VecDeque::new(),
            backlog: Some("0".to_string()),
            attempts: HashMap::new(),
            last_claim: Instant::now(),
        }))
    }
}

/// Stream entries sorted into what the consumer hands out and what it settles
/// on the spot.
#[derive(Debug, Default)]
struct DecodedEntries {
    deliveries: Vec<Delivery>,
    /// Topics this subscription does not read.
    unsubscribed: Vec<String>,
    /// Entries missing a field or naming an unknown topic.
    unusable: Vec<String>,
}

/// Decode entries in stream order.
fn decode_entries(ids: Vec<StreamId>, partition: u32, topics: &[Topic]) -> DecodedEntries {
    let mut decoded = DecodedEntries::default();
    for entry in ids {
        let fields = (
            entry
                .get::<String>(TOPIC_FIELD)
                .and_then(|topic| topic.parse::<Topic>().ok()),
            entry.get::<String>(KEY_FIELD),
            entry.get::<String>(PAYLOAD_FIELD),
        );
        match fields {
            (Some(topic), Some(partition_key), Some(payload)) if topics.contains(&topic) => {
                decoded.deliveries.push(Delivery {
                    id: entry.id,
                    topic,
                    partition,
                    partition_key: partition_key.into(),
                    payload,
                    attempt: 0,
                })
            }
            (Some(_), Some(_), Some(_)) => decoded.unsubscribed.push(entry.id),
            _ => decoded.unusable.push(entry.id),
        }
    }
    decoded
}

struct RedisEventConsumer {
    conn: MultiplexedConnection,
    key: String,
    subscription: Subscription,
    options: StreamOptions,
    buffer: VecDeque<Delivery>,
    /// Last id seen while re-reading this consumer's own pending entries.
    backlog: Option<String>,
    attempts: HashMap<String, u32>,
    last_claim: Instant,
}

impl RedisEventConsumer {
    /// Buffer deliverable entries; acknowledge the rest so they do not stay pending.
    async fn enqueue(&mut self, ids: Vec<StreamId>) -> BusResult<()> {
        let decoded = decode_entries(ids, self.subscription.partition, &self.subscription.topics);
        self.buffer.extend(decoded.deliveries);

        for id in &decoded.unusable {
            warn!(stream = %self.key, %id, "dropping stream entry without usable fields");
        }
        let settled: Vec<&String> = decoded.unusable.iter().chain(&decoded.unsubscribed).collect();
        if !settled.is_empty() {
            let _: i64 = self
                .conn
                .xack(&self.key, &self.subscription.group, settled.as_slice())
                .await?;
        }
        Ok(())
    }

    fn read_options(&self) -> StreamReadOptions {
        StreamReadOptions::default()
            .group(&self.subscription.group, &self.subscription.consumer)
            .count(self.options.batch_size)
    }

    async fn read_backlog(&mut self, from: String) -> BusResult<()> {
        let options = self.read_options();
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.key.as_str()], &[from.as_str()], &options)
            .await?;

        let ids = reply
            .and_then(|reply| reply.keys.into_iter().next())
            .map(|stream| stream.ids)
            .unwrap_or_default();
        self.backlog = ids.last().map(|entry| entry.id.clone());
        self.enqueue(ids).await
    }

    async fn read_new(&mut self) -> BusResult<()> {
        let options = self
            .read_options()
            .block(self.options.block.as_millis() as usize);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.key.as_str()], &[">"], &options)
            .await?;
        for stream in reply.map(|reply| reply.keys).unwrap_or_default() {
            self.enqueue(stream.ids).await?;
        }
        Ok(())
    }

    /// Take over entries other group members left idle past the redelivery timeout.
    async fn claim_idle(&mut self) -> BusResult<()> {
        self.last_claim = Instant::now();
        let min_idle = self.options.redelivery_timeout.as_millis() as u64;
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.key)
            .arg(&self.subscription.group)
            .arg(&self.subscription.consumer)
            .arg(min_idle)
            .arg("0-0")
            .arg("COUNT")
            .arg(self.options.batch_size)
            .query_async(&mut self.conn)
            .await?;

        let claimed = parse_autoclaim(&reply)?;
        if !claimed.is_empty() {
            info!(
                stream = %self.key,
                consumer = %self.subscription.consumer,
                count = claimed.len(),
                "claimed idle entries"
            );
            self.enqueue(claimed).await?;
        }
        Ok(())
    }
}

/// Entries of an `XAUTOCLAIM` reply: `[next-start, [[id, [field, value, ...]], ...], ...]`.
fn parse_autoclaim(reply: &redis::Value) -> BusResult<Vec<StreamId>> {
    match reply {
        redis::Value::Bulk(items) if items.len() >= 2 => {
            let range = StreamRangeReply::from_redis_value(&items[1])?;
            Ok(range.ids)
        }
        _ => Ok(Vec::new()),
    }
}

#[async_trait]
impl EventConsumer for RedisEventConsumer {
    async fn next(&mut self) -> BusResult<Delivery> {
        loop {
            if let Some(mut delivery) = self.buffer.pop_front() {
                let attempts = self.attempts.entry(delivery.id.clone()).or_insert(0);
                *attempts += 1;
                delivery.attempt = *attempts;
                return Ok(delivery);
            }

            if let Some(from) = self.backlog.take() {
                self.read_backlog(from).await?;
                continue;
            }

            if self.last_claim.elapsed() >= self.options.redelivery_timeout / 2 {
                self.claim_idle().await?;
                if !self.buffer.is_empty() {
                    continue;
                }
            }

            self.read_new().await?;
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> BusResult<()> {
        let _: i64 = self
            .conn
            .xack(&self.key, &self.subscription.group, &[&delivery.id])
            .await?;
        self.attempts.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> BusResult<()> {
        debug!(id = %delivery.id, topic = %delivery.topic, "delivery returned to pending");
        // Everything buffered after the nacked entry is pending too and is re-read in order.
        self.buffer.clear();
        self.backlog = Some("0".to_string());
        Ok(())
    }
}
