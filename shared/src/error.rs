use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({max} entries)")]
    QueueFull { max: usize },

    #[error("outbox storage limit exceeded: {size} bytes, max {max}")]
    StorageLimitExceeded { size: usize, max: usize },

    #[error("malformed queued request: {0}")]
    MalformedRequest(String),

    #[error("queued request {id} expired before it could be replayed")]
    RequestExpired { id: String },

    #[error("queued request {id} dropped after {attempts} failed attempts")]
    MaxAttemptsExceeded { id: String, attempts: u32 },

    #[error("network unavailable")]
    NetworkUnavailable,

    #[error("invalid service token: {0}")]
    InvalidService(String),

    #[error("method cannot be queued: {0}")]
    NotQueueable(String),

    #[error("a drain is already in progress")]
    DrainInProgress,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl OutboxError {
    /// Whether the original write is gone for good and the user should be told.
    pub fn is_write_lost(&self) -> bool {
        matches!(
            self,
            OutboxError::QueueFull { .. }
                | OutboxError::StorageLimitExceeded { .. }
                | OutboxError::MaxAttemptsExceeded { .. }
                | OutboxError::RequestExpired { .. }
        )
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(e: serde_json::Error) -> Self {
        OutboxError::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(not(target_arch = "wasm32"))]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::TaskJoin(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_lost_classification() {
        assert!(OutboxError::QueueFull { max: 50 }.is_write_lost());
        assert!(OutboxError::StorageLimitExceeded { size: 10, max: 5 }.is_write_lost());
        assert!(!OutboxError::NetworkUnavailable.is_write_lost());
        assert!(!OutboxError::DrainInProgress.is_write_lost());
    }

    #[test]
    fn test_store_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: OutboxError = StoreError::from(io).into();
        assert!(matches!(err, OutboxError::Storage(StoreError::Io(_))));
        assert!(err.to_string().contains("disk gone"));
    }
}
