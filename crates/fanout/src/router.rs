//! Per-event recipient expansion and dispatch.

use futures_util::future::join_all;
use parley_bus::GatewayChannel;
use parley_events::{
    DomainEvent, GatewayEnvelope, MembershipResolver, PushEvent, UserId,
};
use parley_presence::PresenceRegistry;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{FanoutError, FanoutResult};

/// Outcome of routing one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    /// Members other than the originator.
    pub recipients: usize,
    pub delivered: usize,
    /// Recipients without a presence record.
    pub offline: usize,
    pub failed: usize,
}

impl FanoutReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }
}

enum Dispatch {
    Delivered,
    Offline,
    Failed,
}

pub struct FanoutRouter {
    resolver: Arc<dyn MembershipResolver>,
    presence: Arc<dyn PresenceRegistry>,
    channel: Arc<dyn GatewayChannel>,
}

impl FanoutRouter {
    pub fn new(
        resolver: Arc<dyn MembershipResolver>,
        presence: Arc<dyn PresenceRegistry>,
        channel: Arc<dyn GatewayChannel>,
    ) -> Self {
        Self {
            resolver,
            presence,
            channel,
        }
    }

    /// Push `event` to every online recipient.
    ///
    /// Fails when membership cannot be resolved, or when every attempted dispatch
    /// failed. Offline recipients are skipped without error.
    pub async fn handle(&self, event: &DomainEvent) -> FanoutResult<FanoutReport> {
        let members: HashSet<UserId> = match event {
            DomainEvent::MessageCreated(message) => {
                self.resolver.members(&message.conversation_id).await?
            }
            DomainEvent::ConversationCreated(created) => {
                created.member_ids.iter().cloned().collect()
            }
        };

        let originator = event.originator();
        let mut recipients: Vec<UserId> = members
            .into_iter()
            .filter(|member| member != originator)
            .collect();
        recipients.sort();

        let push = PushEvent::from(event.clone());
        let outcomes = join_all(
            recipients
                .iter()
                .map(|recipient| self.dispatch(recipient, &push)),
        )
        .await;

        let mut report = FanoutReport {
            recipients: recipients.len(),
            ..FanoutReport::default()
        };
        for outcome in outcomes {
            match outcome {
                Dispatch::Delivered => report.delivered += 1,
                Dispatch::Offline => report.offline += 1,
                Dispatch::Failed => report.failed += 1,
            }
        }

        if report.attempted() > 0 && report.delivered == 0 {
            return Err(FanoutError::DispatchFailed {
                failed: report.failed,
            });
        }
        Ok(report)
    }

    async fn dispatch(&self, recipient: &UserId, push: &PushEvent) -> Dispatch {
        let gateway_id = match self.presence.lookup(recipient).await {
            Ok(Some(gateway_id)) => gateway_id,
            Ok(None) => {
                debug!(user_id = %recipient, event = push.name(), "recipient offline");
                return Dispatch::Offline;
            }
            Err(error) => {
                warn!(user_id = %recipient, %error, "presence lookup failed");
                return Dispatch::Failed;
            }
        };

        let envelope = GatewayEnvelope::new(recipient.clone(), push.clone());
        match self.channel.publish(&gateway_id, &envelope).await {
            Ok(()) => Dispatch::Delivered,
            Err(error) => {
                warn!(
                    user_id = %recipient,
                    gateway_id = %gateway_id,
                    %error,
                    "dispatch to gateway failed"
                );
                Dispatch::Failed
            }
        }
    }
}
