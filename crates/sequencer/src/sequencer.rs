//! Per-conversation sequence allocation.

use parley_events::{ConversationId, UserId};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{SequencerError, SequencerResult};

/// Increment and membership check in one statement: there is no window between
/// checking the caller and bumping the counter, and a rejected caller leaves the
/// counter untouched.
const ALLOCATE_SQL: &str = r#"
UPDATE conversations
SET last_seq = last_seq + 1
WHERE conversation_id = ?1
  AND EXISTS (
      SELECT 1 FROM memberships
      WHERE memberships.conversation_id = ?1
        AND memberships.user_id = ?2
        AND memberships.left_at IS NULL
  )
RETURNING last_seq
"#;

#[derive(Clone)]
pub struct Sequencer {
    pool: SqlitePool,
}

impl Sequencer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Allocate the next sequence number of `conversation_id` on behalf of `caller_id`.
    ///
    /// Numbers are never handed out twice. A number whose message never gets
    /// published is simply skipped by readers.
    pub async fn allocate(
        &self,
        conversation_id: &ConversationId,
        caller_id: &UserId,
    ) -> SequencerResult<i64> {
        // `fetch_all` steps the statement to completion; a half-read `RETURNING`
        // statement keeps its write uncommitted on the pooled connection.
        let seq: Option<i64> = sqlx::query_scalar(ALLOCATE_SQL)
            .bind(conversation_id.as_str())
            .bind(caller_id.as_str())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .next();

        match seq {
            Some(seq) => {
                debug!(conversation_id = %conversation_id, user_id = %caller_id, seq, "sequence allocated");
                Ok(seq)
            }
            None if self.conversation_exists(conversation_id).await? => {
                Err(SequencerError::Forbidden {
                    conversation_id: conversation_id.clone(),
                    user_id: caller_id.clone(),
                })
            }
            None => Err(SequencerError::NotFound(conversation_id.clone())),
        }
    }

    /// Highest number handed out so far, 0 before the first allocation.
    pub async fn last_seq(&self, conversation_id: &ConversationId) -> SequencerResult<i64> {
        let last_seq: Option<i64> =
            sqlx::query_scalar("SELECT last_seq FROM conversations WHERE conversation_id = ?")
                .bind(conversation_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        last_seq.ok_or_else(|| SequencerError::NotFound(conversation_id.clone()))
    }

    async fn conversation_exists(&self, conversation_id: &ConversationId) -> SequencerResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE conversation_id = ?)",
        )
        .bind(conversation_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
