//! The gateway's local socket table and its presence upkeep.
//!
//! One [`ConnectionManager`] per gateway process owns the table mapping each
//! connected user to the outbound queue of their socket. A reconnect replaces the
//! entry (last write wins); removal is scoped to the connection that registered
//! the entry, so a superseded socket closing late cannot evict its successor.

use futures_util::StreamExt;
use parley_bus::GatewayChannel;
use parley_config::{GatewayConfig, PresenceConfig};
use parley_events::{GatewayEnvelope, GatewayId, UserId};
use parley_presence::PresenceRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GatewayResult;
use crate::events::ServerEvent;

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Process-unique id of one socket.
pub type ConnectionId = u64;

struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
}

/// A registered socket: its id and the receiving end of its outbound queue.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    /// For replies to the client's own frames.
    pub sender: mpsc::Sender<ServerEvent>,
    pub receiver: mpsc::Receiver<ServerEvent>,
}

/// Counts from one heartbeat pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub refreshed: usize,
    /// Users whose record had vanished and was written again.
    pub retracked: usize,
    pub failed: usize,
}

pub struct ConnectionManager {
    gateway_id: GatewayId,
    presence: Arc<dyn PresenceRegistry>,
    ttl: Duration,
    outbound_buffer: usize,
    next_id: AtomicU64,
    sockets: RwLock<HashMap<UserId, ConnectionHandle>>,
}

impl ConnectionManager {
    pub fn new(
        gateway_id: GatewayId,
        presence: Arc<dyn PresenceRegistry>,
        ttl: Duration,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            gateway_id,
            presence,
            ttl,
            outbound_buffer: outbound_buffer.max(1),
            next_id: AtomicU64::new(1),
            sockets: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(
        gateway: &GatewayConfig,
        presence_config: &PresenceConfig,
        presence: Arc<dyn PresenceRegistry>,
    ) -> Self {
        Self::new(
            GatewayId::from(gateway.gateway_id.as_str()),
            presence,
            presence_config.ttl(),
            gateway.outbound_buffer,
        )
    }

    pub fn gateway_id(&self) -> &GatewayId {
        &self.gateway_id
    }

    pub async fn active_connections(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn is_connected(&self, user_id: &UserId) -> bool {
        self.sockets.read().await.contains_key(user_id)
    }

    /// Add an authenticated socket for `user_id` and claim the user's presence.
    ///
    /// Replaces any socket already registered for the user. The replaced socket
    /// stays open but no longer receives pushes.
    pub async fn register(&self, user_id: &UserId) -> GatewayResult<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.outbound_buffer);

        let superseded = self.sockets.write().await.insert(
            user_id.clone(),
            ConnectionHandle {
                id,
                sender: sender.clone(),
            },
        );
        if let Some(previous) = superseded {
            debug!(user_id = %user_id, previous = previous.id, connection_id = id, "connection superseded");
        }

        if let Err(error) = self
            .presence
            .track(user_id, &self.gateway_id, self.ttl)
            .await
        {
            self.remove_if_current(user_id, id).await;
            return Err(error.into());
        }

        info!(user_id = %user_id, gateway_id = %self.gateway_id, connection_id = id, "connection registered");
        Ok(Connection {
            id,
            user_id: user_id.clone(),
            sender,
            receiver,
        })
    }

    /// Drop the socket `connection_id` of `user_id`, releasing presence if it
    /// was still the current one. Returns whether it was current.
    pub async fn unregister(
        &self,
        user_id: &UserId,
        connection_id: ConnectionId,
    ) -> GatewayResult<bool> {
        if !self.remove_if_current(user_id, connection_id).await {
            debug!(user_id = %user_id, connection_id, "superseded connection closed");
            return Ok(false);
        }

        let released = self.presence.untrack(user_id, &self.gateway_id).await?;
        if !released {
            debug!(user_id = %user_id, gateway_id = %self.gateway_id, "presence owned elsewhere, left in place");
        }

        // A reconnect to this gateway may have landed while the record was being removed.
        if released && self.is_connected(user_id).await {
            self.presence
                .track(user_id, &self.gateway_id, self.ttl)
                .await?;
        }

        info!(user_id = %user_id, connection_id, "connection unregistered");
        Ok(true)
    }

    async fn remove_if_current(&self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        let mut sockets = self.sockets.write().await;
        if sockets
            .get(user_id)
            .is_some_and(|handle| handle.id == connection_id)
        {
            sockets.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Queue `event` on the user's socket. Returns whether it was queued.
    pub async fn send_to(&self, user_id: &UserId, event: ServerEvent) -> bool {
        let sockets = self.sockets.read().await;
        let Some(handle) = sockets.get(user_id) else {
            debug!(user_id = %user_id, "no local socket, push dropped");
            return false;
        };

        match handle.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user_id = %user_id, connection_id = handle.id, "outbound queue full, push dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(user_id = %user_id, connection_id = handle.id, "socket closing, push dropped");
                false
            }
        }
    }

    /// Forward an envelope from the private channel to its recipient's socket.
    pub async fn deliver(&self, envelope: GatewayEnvelope) -> bool {
        let GatewayEnvelope { user_id, push } = envelope;
        self.send_to(&user_id, ServerEvent::from(push)).await
    }

    /// Refresh the presence record of every locally connected user.
    pub async fn heartbeat(&self) -> HeartbeatReport {
        let users: Vec<UserId> = self.sockets.read().await.keys().cloned().collect();
        let mut report = HeartbeatReport::default();

        for user_id in users {
            match self.presence.refresh(&user_id, self.ttl).await {
                Ok(true) => report.refreshed += 1,
                Ok(false) => {
                    if !self.is_connected(&user_id).await {
                        continue;
                    }
                    match self
                        .presence
                        .track(&user_id, &self.gateway_id, self.ttl)
                        .await
                    {
                        Ok(()) => {
                            info!(user_id = %user_id, gateway_id = %self.gateway_id, "presence record restored");
                            report.retracked += 1;
                        }
                        Err(error) => {
                            warn!(user_id = %user_id, %error, "presence restore failed");
                            report.failed += 1;
                        }
                    }
                }
                Err(error) => {
                    warn!(user_id = %user_id, %error, "presence refresh failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            refreshed = report.refreshed,
            retracked = report.retracked,
            failed = report.failed,
            "heartbeat pass"
        );
        report
    }

    pub async fn run_heartbeat(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; records were just written on register.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat().await;
                }
            }
        }
        debug!("heartbeat loop stopped");
    }

    /// Consume this gateway's private channel until shutdown, resubscribing with
    /// backoff whenever the subscription fails or ends.
    pub async fn run_forwarder(
        self: Arc<Self>,
        channel: Arc<dyn GatewayChannel>,
        shutdown: CancellationToken,
    ) {
        let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;
        loop {
            match channel.subscribe(&self.gateway_id).await {
                Ok(mut stream) => {
                    info!(gateway_id = %self.gateway_id, "subscribed to gateway channel");
                    backoff = RESUBSCRIBE_INITIAL_BACKOFF;
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            next = stream.next() => match next {
                                Some(envelope) => {
                                    self.deliver(envelope).await;
                                }
                                None => {
                                    warn!(gateway_id = %self.gateway_id, "gateway channel subscription ended");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(error) => {
                    error!(gateway_id = %self.gateway_id, %error, "gateway channel subscribe failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
        }
    }

    /// Release every presence record this gateway holds and empty the table.
    pub async fn shutdown(&self) {
        let sockets: Vec<UserId> = self
            .sockets
            .write()
            .await
            .drain()
            .map(|(user_id, _)| user_id)
            .collect();

        for user_id in &sockets {
            if let Err(error) = self.presence.untrack(user_id, &self.gateway_id).await {
                warn!(user_id = %user_id, %error, "presence release failed on shutdown");
            }
        }
        info!(gateway_id = %self.gateway_id, released = sockets.len(), "gateway connections released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parley_bus::MemoryGatewayChannel;
    use parley_events::{MessageCreated, PushEvent};
    use parley_presence::{MemoryPresenceRegistry, PresenceError, PresenceResult};

    const TTL: Duration = Duration::from_secs(60);

    fn manager(gateway: &str, presence: &MemoryPresenceRegistry) -> ConnectionManager {
        ConnectionManager::new(gateway.into(), Arc::new(presence.clone()), TTL, 8)
    }

    fn push(seq: i64) -> PushEvent {
        PushEvent::MessageNew(MessageCreated::new(
            "c-1".into(),
            format!("m-{seq}").into(),
            seq,
            "alice".into(),
            Utc::now(),
            "hello",
        ))
    }

    #[tokio::test]
    async fn register_tracks_presence_and_unregister_releases_it() {
        let presence = MemoryPresenceRegistry::new();
        let manager = manager("G1", &presence);
        let bob = UserId::from("bob");

        let connection = manager.register(&bob).await.unwrap();
        assert_eq!(presence.lookup(&bob).await.unwrap(), Some("G1".into()));
        assert_eq!(manager.active_connections().await, 1);

        assert!(manager.unregister(&bob, connection.id).await.unwrap());
        assert_eq!(presence.lookup(&bob).await.unwrap(), None);
        assert_eq!(manager.active_connections().await, 0);
    }

    #[tokio::test]
    async fn late_untrack_from_old_gateway_leaves_new_owner() {
        let presence = MemoryPresenceRegistry::new();
        let g1 = manager("G1", &presence);
        let g2 = manager("G2", &presence);
        let user = UserId::from("U");

        let old = g1.register(&user).await.unwrap();
        let _new = g2.register(&user).await.unwrap();
        assert_eq!(presence.lookup(&user).await.unwrap(), Some("G2".into()));

        // G1 learns about the dropped socket only now.
        assert!(g1.unregister(&user, old.id).await.unwrap());
        assert_eq!(presence.lookup(&user).await.unwrap(), Some("G2".into()));
    }

    #[tokio::test]
    async fn superseded_socket_closing_keeps_the_new_entry() {
        let presence = MemoryPresenceRegistry::new();
        let manager = manager("G1", &presence);
        let user = UserId::from("U");

        let first = manager.register(&user).await.unwrap();
        let mut second = manager.register(&user).await.unwrap();
        assert_ne!(first.id, second.id);

        assert!(!manager.unregister(&user, first.id).await.unwrap());
        assert_eq!(presence.lookup(&user).await.unwrap(), Some("G1".into()));

        assert!(manager.deliver(GatewayEnvelope::new(user.clone(), push(1))).await);
        assert!(matches!(
            second.receiver.recv().await,
            Some(ServerEvent::MessageNew(message)) if message.seq == 1
        ));
    }

    #[tokio::test]
    async fn delivery_to_absent_user_is_dropped() {
        let presence = MemoryPresenceRegistry::new();
        let manager = manager("G1", &presence);
        assert!(!manager.deliver(GatewayEnvelope::new("ghost".into(), push(1))).await);
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_only_that_socket() {
        let presence = MemoryPresenceRegistry::new();
        let manager = ConnectionManager::new("G1".into(), Arc::new(presence.clone()), TTL, 1);
        let slow = manager.register(&"slow".into()).await.unwrap();
        let mut fast = manager.register(&"fast".into()).await.unwrap();

        assert!(manager.deliver(GatewayEnvelope::new("slow".into(), push(1))).await);
        assert!(!manager.deliver(GatewayEnvelope::new("slow".into(), push(2))).await);
        assert!(manager.deliver(GatewayEnvelope::new("fast".into(), push(2))).await);
        assert!(fast.receiver.recv().await.is_some());
        drop(slow);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_records_alive_past_the_ttl() {
        let presence = MemoryPresenceRegistry::new();
        let manager = manager("G1", &presence);
        let _connection = manager.register(&"bob".into()).await.unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(30)).await;
            let report = manager.heartbeat().await;
            assert_eq!(report.refreshed, 1);
        }
        assert_eq!(presence.lookup(&"bob".into()).await.unwrap(), Some("G1".into()));
    }

    #[tokio::test]
    async fn heartbeat_restores_a_vanished_record() {
        let presence = MemoryPresenceRegistry::new();
        let manager = manager("G1", &presence);
        let _connection = manager.register(&"bob".into()).await.unwrap();

        presence.clear().await;
        let report = manager.heartbeat().await;

        assert_eq!(report.retracked, 1);
        assert_eq!(presence.lookup(&"bob".into()).await.unwrap(), Some("G1".into()));
    }

    /// Memory registry that refuses to refresh one user.
    struct FlakyPresence {
        inner: MemoryPresenceRegistry,
        broken: UserId,
    }

    #[async_trait]
    impl PresenceRegistry for FlakyPresence {
        async fn track(&self, user_id: &UserId, gateway_id: &GatewayId, ttl: Duration) -> PresenceResult<()> {
            self.inner.track(user_id, gateway_id, ttl).await
        }

        async fn refresh(&self, user_id: &UserId, ttl: Duration) -> PresenceResult<bool> {
            if user_id == &self.broken {
                return Err(PresenceError::Unavailable("connection reset".into()));
            }
            self.inner.refresh(user_id, ttl).await
        }

        async fn lookup(&self, user_id: &UserId) -> PresenceResult<Option<GatewayId>> {
            self.inner.lookup(user_id).await
        }

        async fn untrack(&self, user_id: &UserId, gateway_id: &GatewayId) -> PresenceResult<bool> {
            self.inner.untrack(user_id, gateway_id).await
        }
    }

    #[tokio::test]
    async fn one_failed_refresh_does_not_stop_the_others() {
        let presence = Arc::new(FlakyPresence {
            inner: MemoryPresenceRegistry::new(),
            broken: "bob".into(),
        });
        let manager = ConnectionManager::new("G1".into(), presence, TTL, 8);
        let mut connections = Vec::new();
        for user in ["alice", "bob", "carol"] {
            connections.push(manager.register(&user.into()).await.unwrap());
        }

        let report = manager.heartbeat().await;
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn forwarder_delivers_channel_envelopes_to_local_sockets() {
        let presence = MemoryPresenceRegistry::new();
        let manager = Arc::new(manager("G1", &presence));
        let channel = MemoryGatewayChannel::new();
        let mut connection = manager.register(&"bob".into()).await.unwrap();

        let shutdown = CancellationToken::new();
        let forwarder = tokio::spawn(
            manager
                .clone()
                .run_forwarder(Arc::new(channel.clone()), shutdown.clone()),
        );

        // The subscription is live once a publish reaches the socket.
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                channel
                    .publish(&"G1".into(), &GatewayEnvelope::new("bob".into(), push(9)))
                    .await
                    .unwrap();
                tokio::select! {
                    event = connection.receiver.recv() => break event,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(received, Some(ServerEvent::MessageNew(message)) if message.seq == 9));
        shutdown.cancel();
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_releases_every_local_user() {
        let presence = MemoryPresenceRegistry::new();
        let manager = manager("G1", &presence);
        let _a = manager.register(&"alice".into()).await.unwrap();
        let _b = manager.register(&"bob".into()).await.unwrap();

        manager.shutdown().await;

        assert_eq!(presence.len().await, 0);
        assert_eq!(manager.active_connections().await, 0);
    }
}
