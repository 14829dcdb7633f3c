//! Per-gateway private channels.
//!
//! Each gateway subscribes to exactly one channel, `gateway:{gateway_id}`. The fanout
//! router publishes one envelope per recipient onto the channel of the gateway that
//! owns the recipient's connection. A single channel is delivered in publish order.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parley_events::{GatewayEnvelope, GatewayId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};

const MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// Name of a gateway's private channel.
///
/// ```
/// use parley_bus::channel_name;
/// use parley_events::GatewayId;
///
/// assert_eq!(channel_name(&GatewayId::from("gw-1")), "gateway:gw-1");
/// ```
pub fn channel_name(gateway_id: &GatewayId) -> String {
    format!("gateway:{gateway_id}")
}

#[async_trait]
pub trait GatewayChannel: Send + Sync {
    async fn publish(&self, gateway_id: &GatewayId, envelope: &GatewayEnvelope) -> BusResult<()>;

    /// Envelopes published to `gateway_id` from now on. Undecodable messages are skipped.
    async fn subscribe(&self, gateway_id: &GatewayId)
        -> BusResult<BoxStream<'static, GatewayEnvelope>>;
}

/// Redis pub/sub channels.
#[derive(Clone)]
pub struct RedisGatewayChannel {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisGatewayChannel {
    pub async fn connect(client: redis::Client) -> BusResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl GatewayChannel for RedisGatewayChannel {
    async fn publish(&self, gateway_id: &GatewayId, envelope: &GatewayEnvelope) -> BusResult<()> {
        let payload = envelope
            .encode()
            .map_err(|error| BusError::ChannelUnavailable(format!("{gateway_id}: {error}")))?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel_name(gateway_id), payload).await?;
        if receivers == 0 {
            // The gateway died after its presence record was read; the record will expire.
            debug!(gateway_id = %gateway_id, user_id = %envelope.user_id, "no subscriber on gateway channel");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        gateway_id: &GatewayId,
    ) -> BusResult<BoxStream<'static, GatewayEnvelope>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel_name(gateway_id)).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|message| async move {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(%error, "unreadable gateway channel message");
                        return None;
                    }
                };
                match GatewayEnvelope::decode(&payload) {
                    Ok(envelope) => Some(envelope),
                    Err(error) => {
                        warn!(%error, "dropping malformed gateway envelope");
                        None
                    }
                }
            })
            .boxed();
        Ok(stream)
    }
}

/// In-process channels backed by broadcast senders, one per gateway.
///
/// Records every published envelope and can be told to fail publishes to chosen
/// gateways, which is what pipeline tests need.
#[derive(Clone, Default)]
pub struct MemoryGatewayChannel {
    senders: Arc<Mutex<HashMap<String, broadcast::Sender<GatewayEnvelope>>>>,
    published: Arc<Mutex<Vec<(GatewayId, GatewayEnvelope)>>>,
    failing: Arc<Mutex<HashSet<GatewayId>>>,
}

impl MemoryGatewayChannel {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender(&self, gateway_id: &GatewayId) -> broadcast::Sender<GatewayEnvelope> {
        let mut senders = self.senders.lock().await;
        senders
            .entry(channel_name(gateway_id))
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Every envelope successfully published so far, in publish order.
    pub async fn published(&self) -> Vec<(GatewayId, GatewayEnvelope)> {
        self.published.lock().await.clone()
    }

    /// Make publishes to `gateway_id` fail until cleared.
    pub async fn fail_gateway(&self, gateway_id: &GatewayId) {
        self.failing.lock().await.insert(gateway_id.clone());
    }

    pub async fn restore_gateway(&self, gateway_id: &GatewayId) {
        self.failing.lock().await.remove(gateway_id);
    }
}

#[async_trait]
impl GatewayChannel for MemoryGatewayChannel {
    async fn publish(&self, gateway_id: &GatewayId, envelope: &GatewayEnvelope) -> BusResult<()> {
        if self.failing.lock().await.contains(gateway_id) {
            return Err(BusError::ChannelUnavailable(gateway_id.to_string()));
        }
        self.published
            .lock()
            .await
            .push((gateway_id.clone(), envelope.clone()));
        // No subscriber is fine: the gateway is gone and its presence will expire.
        let _ = self.sender(gateway_id).await.send(envelope.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        gateway_id: &GatewayId,
    ) -> BusResult<BoxStream<'static, GatewayEnvelope>> {
        let receiver = self.sender(gateway_id).await.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => return Some((envelope, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "gateway channel subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parley_events::{MessageCreated, PushEvent};

    fn envelope(user: &str, seq: i64) -> GatewayEnvelope {
        let message = MessageCreated::new(
            "c-1".into(),
            format!("m-{seq}").into(),
            seq,
            "alice".into(),
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            "hello",
        );
        GatewayEnvelope::new(user.into(), PushEvent::MessageNew(message))
    }

    #[tokio::test]
    async fn subscriber_receives_envelopes_in_publish_order() {
        let channel = MemoryGatewayChannel::new();
        let gateway = GatewayId::from("gw-1");
        let mut stream = channel.subscribe(&gateway).await.unwrap();

        for seq in 1..=3 {
            channel.publish(&gateway, &envelope("bob", seq)).await.unwrap();
        }

        for seq in 1..=3 {
            assert_eq!(stream.next().await.unwrap(), envelope("bob", seq));
        }
    }

    #[tokio::test]
    async fn channels_are_private_to_their_gateway() {
        let channel = MemoryGatewayChannel::new();
        let mut first = channel.subscribe(&GatewayId::from("gw-1")).await.unwrap();
        let mut second = channel.subscribe(&GatewayId::from("gw-2")).await.unwrap();

        channel
            .publish(&GatewayId::from("gw-2"), &envelope("bob", 1))
            .await
            .unwrap();

        assert_eq!(second.next().await.unwrap().user_id.as_str(), "bob");
        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), first.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn failing_gateway_rejects_publishes_until_restored() {
        let channel = MemoryGatewayChannel::new();
        let gateway = GatewayId::from("gw-1");
        channel.fail_gateway(&gateway).await;

        let result = channel.publish(&gateway, &envelope("bob", 1)).await;
        assert!(matches!(result, Err(BusError::ChannelUnavailable(_))));
        assert!(channel.published().await.is_empty());

        channel.restore_gateway(&gateway).await;
        channel.publish(&gateway, &envelope("bob", 1)).await.unwrap();
        assert_eq!(channel.published().await.len(), 1);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_succeeds() {
        let channel = MemoryGatewayChannel::new();
        channel
            .publish(&GatewayId::from("gw-9"), &envelope("bob", 1))
            .await
            .unwrap();
    }
}
