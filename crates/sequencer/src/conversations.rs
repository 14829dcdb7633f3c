//! Conversation and membership rows.
//!
//! Conversation management proper lives with the conversation service; this
//! repository covers what the delivery pipeline needs to read, plus creation so
//! development setups and tests can seed data.

use async_trait::async_trait;
use chrono::Utc;
use parley_events::{
    ConversationCreated, ConversationId, ConversationKind, MembershipResolver, ResolveError,
    ResolveResult, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::info;

use crate::error::{SequencerError, SequencerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipRole {
    #[serde(rename = "ADMIN")]
    Admin,
    #[serde(rename = "MEMBER")]
    Member,
}

impl MembershipRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipRole::Admin => "ADMIN",
            MembershipRole::Member => "MEMBER",
        }
    }
}

impl From<&str> for MembershipRole {
    fn from(value: &str) -> Self {
        match value {
            "ADMIN" => MembershipRole::Admin,
            _ => MembershipRole::Member,
        }
    }
}

fn kind_as_str(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Direct => "DM",
        ConversationKind::Group => "GROUP",
    }
}

/// A current member as listed by the internal members endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub user_id: UserId,
    pub role: MembershipRole,
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub created_by: UserId,
    /// Members besides the creator. Duplicates are ignored.
    pub member_ids: Vec<UserId>,
}

#[derive(Clone)]
pub struct ConversationRepository {
    pool: SqlitePool,
}

impl ConversationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a conversation with its creator (as admin) and members, returning the
    /// event announcing it.
    pub async fn create(&self, request: NewConversation) -> SequencerResult<ConversationCreated> {
        if request.kind == ConversationKind::Direct && request.member_ids.len() != 1 {
            return Err(SequencerError::Validation(
                "a direct conversation has exactly one other member".to_string(),
            ));
        }

        let conversation_id = ConversationId::new(uuid::Uuid::new_v4().to_string());
        let created_at = Utc::now();
        let now = created_at.to_rfc3339();

        let mut member_ids = vec![request.created_by.clone()];
        for member in request.member_ids {
            if !member_ids.contains(&member) {
                member_ids.push(member);
            }
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO conversations (conversation_id, type, title, created_by, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation_id.as_str())
        .bind(kind_as_str(request.kind))
        .bind(request.title.as_deref())
        .bind(request.created_by.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        for member in &member_ids {
            let role = if member == &request.created_by {
                MembershipRole::Admin
            } else {
                MembershipRole::Member
            };
            sqlx::query(
                "INSERT INTO memberships (conversation_id, user_id, role, joined_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id.as_str())
            .bind(member.as_str())
            .bind(role.as_str())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(
            conversation_id = %conversation_id,
            created_by = %request.created_by,
            members = member_ids.len(),
            "conversation created"
        );

        Ok(ConversationCreated {
            conversation_id,
            kind: request.kind,
            title: request.title,
            member_ids,
            created_by: request.created_by,
            created_at,
        })
    }

    /// Add `user_id`, or bring back a member who had left.
    pub async fn add_member(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> SequencerResult<()> {
        if !self.exists(conversation_id).await? {
            return Err(SequencerError::NotFound(conversation_id.clone()));
        }
        sqlx::query(
            "INSERT INTO memberships (conversation_id, user_id, role, joined_at)
             VALUES (?, ?, 'MEMBER', ?)
             ON CONFLICT (conversation_id, user_id) DO UPDATE SET left_at = NULL",
        )
        .bind(conversation_id.as_str())
        .bind(user_id.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a member as having left. Returns whether a current membership existed.
    pub async fn leave(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> SequencerResult<bool> {
        let result = sqlx::query(
            "UPDATE memberships SET left_at = ?
             WHERE conversation_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(conversation_id.as_str())
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn exists(&self, conversation_id: &ConversationId) -> SequencerResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE conversation_id = ?)",
        )
        .bind(conversation_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Members who have not left, oldest first.
    pub async fn active_members(
        &self,
        conversation_id: &ConversationId,
    ) -> SequencerResult<Vec<MemberRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, role FROM memberships
             WHERE conversation_id = ? AND left_at IS NULL
             ORDER BY joined_at ASC, user_id ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() && !self.exists(conversation_id).await? {
            return Err(SequencerError::NotFound(conversation_id.clone()));
        }

        rows.into_iter()
            .map(|row| -> SequencerResult<MemberRecord> {
                let user_id: String = row.try_get("user_id")?;
                let role: String = row.try_get("role")?;
                Ok(MemberRecord {
                    user_id: user_id.into(),
                    role: MembershipRole::from(role.as_str()),
                })
            })
            .collect()
    }
}

/// Resolves members straight from the sequencer database, for deployments that
/// run the fanout router next to it.
#[derive(Clone)]
pub struct SqlMembershipResolver {
    conversations: ConversationRepository,
}

impl SqlMembershipResolver {
    pub fn new(conversations: ConversationRepository) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl MembershipResolver for SqlMembershipResolver {
    async fn members(&self, conversation_id: &ConversationId) -> ResolveResult<HashSet<UserId>> {
        match self.conversations.active_members(conversation_id).await {
            Ok(members) => Ok(members.into_iter().map(|member| member.user_id).collect()),
            Err(SequencerError::NotFound(id)) => Err(ResolveError::NotFound(id)),
            Err(error) => Err(ResolveError::Unavailable(error.to_string())),
        }
    }
}
