use uuid::Uuid;

/// Result type alias for ingest worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the crawl-and-ingest worker core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Session corrupted: {0}")]
    SessionCorrupted(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] anyhow::Error),

    #[error("Embedding call timed out")]
    EmbeddingTimeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Circuit breaker open")]
    CircuitBreakerOpen,

    #[error("Execution timeout")]
    ExecutionTimeout,

    #[error("Crawl error: {0}")]
    Crawl(String),

    #[error("Tenant suspended: {0}")]
    TenantSuspended(Uuid),

    #[error("Not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is recoverable (can retry with backoff)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Recoverable errors (can retry with backoff)
            Error::Storage(_)
            | Error::Redis(_)
            | Error::SessionCorrupted(_)
            | Error::Embedding(_)
            | Error::EmbeddingTimeout
            | Error::Http(_)
            | Error::CircuitBreakerOpen
            | Error::ExecutionTimeout
            | Error::Crawl(_)
            | Error::Io(_) => true,
            // Non-recoverable errors
            Error::TenantSuspended(_)
            | Error::NotFound(_)
            | Error::InvalidInput(_)
            | Error::Unauthorized(_)
            | Error::Configuration(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Check whether this error indicates a database session whose internal
    /// state no longer permits any statement to execute.
    ///
    /// Uses both the typed variant and message matching, because the typed
    /// variant may not survive serialization across task boundaries.
    #[must_use]
    pub fn is_session_corruption(&self) -> bool {
        match self {
            Error::SessionCorrupted(_) => true,
            Error::Storage(msg) => message_indicates_session_corruption(msg),
            _ => false,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Redis(err.to_string())
    }
}

/// Check whether an error message string indicates a corrupted session.
///
/// The substring test exists because the original exception type may not be
/// available when the message arrives from a logged or serialized error.
#[must_use]
pub fn message_indicates_session_corruption(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("invalid transaction")
        || msg.contains("can't reconnect")
        || msg.contains("pending rollback")
        || msg.contains("autobegin is disabled")
        || msg.contains("another operation is in progress")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_errors_are_recoverable() {
        let err = Error::Redis("connection refused".to_string());
        assert!(err.is_recoverable());
    }

    #[test]
    fn validation_errors_are_not_recoverable() {
        let err = Error::InvalidInput("unknown mime type".to_string());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn corruption_detected_from_typed_variant() {
        let err = Error::SessionCorrupted("rollback pending".to_string());
        assert!(err.is_session_corruption());
    }

    #[test]
    fn corruption_detected_from_message_substrings() {
        for msg in [
            "sqlalchemy-style PENDING ROLLBACK detected",
            "connection invalid transaction state",
            "autobegin is disabled on this session",
            "InterfaceError: another operation is in progress",
            "can't reconnect until invalid transaction is rolled back",
        ] {
            assert!(
                message_indicates_session_corruption(msg),
                "expected corruption match for: {msg}"
            );
        }
        assert!(!message_indicates_session_corruption("row not found"));
    }

    #[test]
    fn storage_error_with_corruption_message_is_classified() {
        let err = Error::Storage("cannot execute: pending rollback".to_string());
        assert!(err.is_session_corruption());

        let err = Error::Storage("table is locked".to_string());
        assert!(!err.is_session_corruption());
    }
}
