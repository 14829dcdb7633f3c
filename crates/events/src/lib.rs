//! # Parley Events
//!
//! Types shared by every stage of the delivery pipeline:
//!
//! - **Identifiers**: strongly typed user, conversation, message and gateway ids
//! - **Domain events**: the closed set of events published on the bus
//! - **Envelopes**: what the fanout router hands to a gateway's private channel
//! - **Membership**: the collaborator interface used to expand a conversation into recipients

pub mod domain;
pub mod envelope;
pub mod ids;
pub mod membership;

pub use domain::{
    ConversationCreated, ConversationKind, DomainEvent, EventDecodeError, MessageCreated, Topic,
    PREVIEW_LENGTH,
};
pub use envelope::{EnvelopeError, GatewayEnvelope, PushEvent};
pub use ids::{ConversationId, GatewayId, MessageId, UserId};
pub use membership::{MembershipResolver, ResolveError, ResolveResult};
