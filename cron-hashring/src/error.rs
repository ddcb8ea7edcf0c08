use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[cfg(feature = "driver-redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The membership store did not answer the startup ping.
    #[error("Membership store unreachable: {0}")]
    Unreachable(String),

    #[error("Membership store error: {0}")]
    Store(String),

    #[error("Membership store call timed out after {0:?}")]
    Timeout(Duration),

    /// Registration or the first membership refresh failed inside `start()`/`run()`.
    #[error("Crond start failed: {0}")]
    Startup(#[source] Box<Error>),

    #[error("job[{0}] already exists")]
    DuplicateJob(String),

    #[error("Invalid schedule '{spec}': {reason}")]
    InvalidSchedule { spec: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for failures of a single store round-trip, which the background
    /// loops log and retry on their next period.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "driver-redis")]
            Self::Redis(_) => true,
            Self::Store(_) | Self::Timeout(_) | Self::Unreachable(_) => true,
            _ => false,
        }
    }
}
