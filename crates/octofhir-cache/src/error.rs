use std::time::Duration;

/// Errors raised by the cache layer.
///
/// Callers on the request path treat every variant as a miss or a no-op;
/// these never reach the client.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend is not connected")]
    NotConnected,

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid sequence id: {0}")]
    InvalidSequenceId(String),

    #[error("cache log {0} does not exist")]
    MissingLog(String),

    #[error("malformed cache reply: {0}")]
    MalformedReply(String),
}

impl CacheError {
    /// Returns `true` for errors caused by the backend being unreachable.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::NotConnected | Self::Timeout(_) => true,
            Self::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
