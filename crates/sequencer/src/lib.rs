//! # Parley Sequencer
//!
//! Hands out strictly increasing, per-conversation sequence numbers and serves
//! the membership data the fanout router needs.
//!
//! - [`Sequencer`]: atomic increment-and-return with the membership check folded in
//! - [`ConversationRepository`]: conversation and membership rows
//! - [`MessageSender`]: allocate, store, publish `MessageCreated`
//! - [`api`]: the HTTP routes

pub mod api;
pub mod connection;
pub mod conversations;
pub mod error;
pub mod migrations;
pub mod sender;
pub mod sequencer;

pub use api::{create_router, SequencerState};
pub use connection::prepare_database;
pub use conversations::{
    ConversationRepository, MemberRecord, MembershipRole, NewConversation, SqlMembershipResolver,
};
pub use error::{SequencerError, SequencerResult};
pub use migrations::{initialize_database, run_migrations, MIGRATOR};
pub use sender::{MessageSender, MessageStore, NoopMessageStore, StoredMessage, MAX_BODY_CHARS};
pub use sequencer::Sequencer;
