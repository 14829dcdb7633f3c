//! Membership lookups against the conversation service.

use async_trait::async_trait;
use parley_config::MembershipConfig;
use parley_events::{ConversationId, MembershipResolver, ResolveError, ResolveResult, UserId};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct MemberEntry {
    user_id: UserId,
}

/// Calls `GET {base_url}/internal/conversations/{id}/members`.
#[derive(Clone)]
pub struct HttpMembershipResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMembershipResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> ResolveResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| ResolveError::Unavailable(error.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &MembershipConfig) -> ResolveResult<Self> {
        Self::new(config.base_url.clone(), config.timeout())
    }

    fn members_url(&self, conversation_id: &ConversationId) -> String {
        format!(
            "{}/internal/conversations/{}/members",
            self.base_url, conversation_id
        )
    }
}

fn request_error(error: reqwest::Error) -> ResolveError {
    if error.is_timeout() {
        ResolveError::Timeout
    } else {
        ResolveError::Unavailable(error.to_string())
    }
}

#[async_trait]
impl MembershipResolver for HttpMembershipResolver {
    async fn members(&self, conversation_id: &ConversationId) -> ResolveResult<HashSet<UserId>> {
        let response = self
            .client
            .get(self.members_url(conversation_id))
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(ResolveError::NotFound(conversation_id.clone())),
            status if !status.is_success() => {
                return Err(ResolveError::Unavailable(format!(
                    "membership service answered {status}"
                )))
            }
            _ => {}
        }

        let entries: Vec<MemberEntry> = response.json().await.map_err(request_error)?;
        Ok(entries.into_iter().map(|entry| entry.user_id).collect())
    }
}

/// Bounded exponential backoff for membership lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry), without jitter.
    ///
    /// ```
    /// use parley_fanout::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(1), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(2), Duration::from_millis(200));
    /// assert_eq!(policy.backoff(10), Duration::from_secs(2));
    /// ```
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn jittered_backoff(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        let spread = (base.as_millis() / 4) as u64;
        if spread == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&MembershipConfig::default())
    }
}

impl From<&MembershipConfig> for RetryPolicy {
    fn from(config: &MembershipConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.timeout(),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Retries transient lookup failures. An unknown conversation is returned at once.
#[derive(Clone)]
pub struct RetryingResolver {
    inner: Arc<dyn MembershipResolver>,
    policy: RetryPolicy,
}

impl RetryingResolver {
    pub fn new(inner: Arc<dyn MembershipResolver>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl MembershipResolver for RetryingResolver {
    async fn members(&self, conversation_id: &ConversationId) -> ResolveResult<HashSet<UserId>> {
        let mut attempt = 1;
        loop {
            let result =
                match tokio::time::timeout(self.policy.attempt_timeout, self.inner.members(conversation_id))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ResolveError::Timeout),
                };

            match result {
                Ok(members) => {
                    if attempt > 1 {
                        debug!(conversation_id = %conversation_id, attempt, "membership resolved after retry");
                    }
                    return Ok(members);
                }
                Err(error) if !error.is_transient() || attempt >= self.policy.max_attempts => {
                    return Err(error)
                }
                Err(error) => {
                    let delay = self.policy.jittered_backoff(attempt);
                    warn!(
                        conversation_id = %conversation_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "membership lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
