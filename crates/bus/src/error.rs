use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("partition {partition} out of range, bus has {partitions} partitions")]
    PartitionOutOfRange { partition: u32, partitions: u32 },

    #[error("subscription has no topics")]
    EmptySubscription,

    #[error("channel for gateway {0} is unavailable")]
    ChannelUnavailable(String),

    #[error("bus closed")]
    Closed,
}

impl BusError {
    /// Connectivity problems may clear up; a bad subscription never will.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Redis(_) | BusError::ChannelUnavailable(_) | BusError::Closed
        )
    }
}

pub type BusResult<T> = Result<T, BusError>;
