use async_trait::async_trait;
use parley_events::{GatewayId, UserId};
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::debug;

use crate::{PresenceRegistry, PresenceResult};

/// Deletes the key only while it still holds the caller's gateway id.
const UNTRACK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// ```
/// use parley_events::UserId;
/// use parley_presence::presence_key;
///
/// assert_eq!(presence_key(&UserId::from("u-1")), "user:u-1:gateway");
/// ```
pub fn presence_key(user_id: &UserId) -> String {
    format!("user:{user_id}:gateway")
}

/// Redis expiry has second granularity; sub-second TTLs round up to one second.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[derive(Clone)]
pub struct RedisPresenceRegistry {
    conn: ConnectionManager,
    untrack_script: Script,
}

impl RedisPresenceRegistry {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            untrack_script: Script::new(UNTRACK_SCRIPT),
        }
    }
}

#[async_trait]
impl PresenceRegistry for RedisPresenceRegistry {
    async fn track(
        &self,
        user_id: &UserId,
        gateway_id: &GatewayId,
        ttl: Duration,
    ) -> PresenceResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(presence_key(user_id))
            .arg(gateway_id.as_str())
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn refresh(&self, user_id: &UserId, ttl: Duration) -> PresenceResult<bool> {
        let mut conn = self.conn.clone();
        let extended: bool = redis::cmd("EXPIRE")
            .arg(presence_key(user_id))
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(extended)
    }

    async fn lookup(&self, user_id: &UserId) -> PresenceResult<Option<GatewayId>> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = redis::cmd("GET")
            .arg(presence_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(owner.map(GatewayId::from))
    }

    async fn untrack(&self, user_id: &UserId, gateway_id: &GatewayId) -> PresenceResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .untrack_script
            .key(presence_key(user_id))
            .arg(gateway_id.as_str())
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!(user_id = %user_id, gateway_id = %gateway_id, "presence owned elsewhere, left intact");
        }
        Ok(deleted > 0)
    }
}
