use parley_bus::BusError;
use parley_events::ResolveError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("membership resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("all {failed} dispatches failed")]
    DispatchFailed { failed: usize },

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

impl FanoutError {
    /// Whether handing the event back to the bus may help.
    pub fn is_transient(&self) -> bool {
        match self {
            FanoutError::Resolve(error) => error.is_transient(),
            FanoutError::DispatchFailed { .. } => true,
            FanoutError::Bus(error) => error.is_transient(),
        }
    }
}

pub type FanoutResult<T> = Result<T, FanoutError>;
