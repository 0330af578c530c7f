//! Error types for the event buffer library.

use thiserror::Error;

/// Result type alias for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors that can occur while buffering, flushing or inspecting events.
#[derive(Error, Debug)]
pub enum BufferError {
    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Shared store rejected or could not apply an operation
    #[error("Store error: {0}")]
    Store(String),

    /// Store round trip exceeded the configured command timeout
    #[error("Store command timed out after {0}ms")]
    Timeout(u64),

    /// Analytical store insert failed
    #[error("ClickHouse error: {0}")]
    ClickHouse(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lookup variant that this buffer does not keep state for
    #[error("Unsupported lookup: {0}")]
    UnsupportedLookup(String),
}

impl From<clickhouse::error::Error> for BufferError {
    fn from(err: clickhouse::error::Error) -> Self {
        BufferError::ClickHouse(err.to_string())
    }
}

impl BufferError {
    /// Whether a later attempt may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BufferError::Redis(_)
                | BufferError::Store(_)
                | BufferError::Timeout(_)
                | BufferError::ClickHouse(_)
        )
    }
}
