//! # Parley Fanout
//!
//! Consumes domain events from the bus, expands each into its recipients and
//! pushes one envelope per online recipient onto the channel of the gateway that
//! holds the recipient's connection.

pub mod error;
pub mod resolver;
pub mod router;
pub mod worker;

pub use error::{FanoutError, FanoutResult};
pub use resolver::{HttpMembershipResolver, RetryPolicy, RetryingResolver};
pub use router::{FanoutReport, FanoutRouter};
pub use worker::{spawn_partition_workers, PartitionWorker, Settlement};
