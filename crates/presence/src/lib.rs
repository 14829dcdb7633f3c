//! # Parley Presence
//!
//! Shared map from user id to the gateway instance holding that user's live
//! connection. Records expire unless the owning gateway keeps refreshing them.
//!
//! Writes never need a lock: `track` and `refresh` are idempotent overwrites, and
//! `untrack` deletes only when the caller still owns the record, so a gateway that
//! learns late about a disconnect cannot erase the record of a newer connection
//! held elsewhere.

pub mod memory;
pub mod redis_registry;

pub use memory::MemoryPresenceRegistry;
pub use redis_registry::{presence_key, RedisPresenceRegistry};

use async_trait::async_trait;
use parley_events::{GatewayId, UserId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("presence registry unavailable: {0}")]
    Unavailable(String),
}

impl PresenceError {
    pub fn is_transient(&self) -> bool {
        true
    }
}

pub type PresenceResult<T> = Result<T, PresenceError>;

#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Record `gateway_id` as the owner of `user_id`, replacing any previous owner.
    async fn track(&self, user_id: &UserId, gateway_id: &GatewayId, ttl: Duration)
        -> PresenceResult<()>;

    /// Extend the record's lifetime without touching its owner.
    /// Returns `false` when there was no record to extend.
    async fn refresh(&self, user_id: &UserId, ttl: Duration) -> PresenceResult<bool>;

    async fn lookup(&self, user_id: &UserId) -> PresenceResult<Option<GatewayId>>;

    /// Delete the record only if `gateway_id` still owns it. Returns whether it was deleted.
    async fn untrack(&self, user_id: &UserId, gateway_id: &GatewayId) -> PresenceResult<bool>;
}
