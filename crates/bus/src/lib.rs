//! # Parley Bus
//!
//! Transport between the stages of the delivery pipeline:
//!
//! - **Event bus**: a durable log partitioned by conversation id, consumed through
//!   consumer groups with explicit acknowledgement ([`EventBus`], [`EventConsumer`])
//! - **Gateway channels**: one ordered pub/sub channel per gateway instance ([`GatewayChannel`])
//!
//! Both come in a Redis-backed flavour for deployment and an in-memory flavour with
//! the same semantics for tests and single-process development.

pub mod bus;
pub mod channel;
pub mod error;
pub mod memory;
pub mod partition;
pub mod publisher;
pub mod redis_streams;

pub use bus::{Delivery, DeliveryId, EventBus, EventConsumer, Subscription};
pub use channel::{channel_name, GatewayChannel, MemoryGatewayChannel, RedisGatewayChannel};
pub use error::{BusError, BusResult};
pub use memory::MemoryEventBus;
pub use partition::partition_for;
pub use publisher::EventPublisher;
pub use redis_streams::{RedisEventBus, StreamOptions};
