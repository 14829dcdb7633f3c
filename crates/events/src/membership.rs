//! Membership collaborator interface.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

use crate::ids::{ConversationId, UserId};

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("membership lookup timed out")]
    Timeout,

    #[error("membership service unavailable: {0}")]
    Unavailable(String),
}

impl ResolveError {
    /// Timeouts and outages may succeed on retry; an unknown conversation never will.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ResolveError::NotFound(_))
    }
}

/// Returns the current members of a conversation, excluding members who have left.
#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn members(&self, conversation_id: &ConversationId) -> ResolveResult<HashSet<UserId>>;
}
