use async_trait::async_trait;
use parley_events::{GatewayId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{PresenceRegistry, PresenceResult};

/// Process-local registry with lazy expiry. Follows the tokio clock, so tests can
/// pause and advance time to expire records.
#[derive(Clone, Default)]
pub struct MemoryPresenceRegistry {
    records: Arc<Mutex<HashMap<UserId, (GatewayId, Instant)>>>,
}

impl MemoryPresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every record, as a registry restart would.
    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }

    /// Number of unexpired records.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }
}

#[async_trait]
impl PresenceRegistry for MemoryPresenceRegistry {
    async fn track(
        &self,
        user_id: &UserId,
        gateway_id: &GatewayId,
        ttl: Duration,
    ) -> PresenceResult<()> {
        self.records
            .lock()
            .await
            .insert(user_id.clone(), (gateway_id.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn refresh(&self, user_id: &UserId, ttl: Duration) -> PresenceResult<bool> {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let Some((_, expires_at)) = records.get_mut(user_id) else {
            return Ok(false);
        };
        if *expires_at > now {
            *expires_at = now + ttl;
            return Ok(true);
        }
        records.remove(user_id);
        Ok(false)
    }

    async fn lookup(&self, user_id: &UserId) -> PresenceResult<Option<GatewayId>> {
        let now = Instant::now();
        let records = self.records.lock().await;
        Ok(records
            .get(user_id)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(gateway_id, _)| gateway_id.clone()))
    }

    async fn untrack(&self, user_id: &UserId, gateway_id: &GatewayId) -> PresenceResult<bool> {
        let now = Instant::now();
        let mut records = self.records.lock().await;
        let owned = records
            .get(user_id)
            .is_some_and(|(owner, expires_at)| owner == gateway_id && *expires_at > now);
        if owned {
            records.remove(user_id);
        }
        Ok(owned)
    }
}
