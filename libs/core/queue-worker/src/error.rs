//! Worker and handler error types
//!
//! Handler errors are categorized to pick the message disposition:
//! - **Transient**: retried through the scheduler, then acked
//! - **Permanent**: acked without retry (and dead-lettered when a DLQ is configured)
//! - **Unexpected**: rejected without requeue

use thiserror::Error;

/// Category of a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure, eligible for a delayed retry
    Transient,
    /// Will never succeed, drop after recording
    Permanent,
    /// Outside the anticipated failure paths
    Unexpected,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unexpected => "unexpected",
        }
    }
}

/// Errors raised by the queue plumbing (transport, producer, dead-letter queue)
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport failure not tied to a specific backend
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted after the transport was closed
    #[error("Transport is closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    pub fn transport(message: impl Into<String>) -> Self {
        WorkerError::Transport(message.into())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, WorkerError::Closed)
    }

    /// Whether this error means the connection itself is unhealthy
    pub fn is_connection_error(&self) -> bool {
        match self {
            WorkerError::Redis(e) => {
                let lower = e.to_string().to_lowercase();
                lower.contains("connection")
                    || lower.contains("disconnected")
                    || lower.contains("broken pipe")
                    || lower.contains("reset by peer")
                    || lower.contains("refused")
                    || lower.contains("eof")
                    || lower.contains("io error")
            }
            WorkerError::Closed => true,
            _ => false,
        }
    }

    pub fn is_nogroup_error(&self) -> bool {
        matches!(self, WorkerError::Redis(e) if e.to_string().contains("NOGROUP"))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(err: serde_json::Error) -> Self {
        WorkerError::Serialization(err.to_string())
    }
}

/// Errors returned by a [`JobHandler`](crate::JobHandler)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Payload failed decoding or validation
    #[error("Invalid payload: {0}")]
    Invalid(String),

    /// Processing failed but may succeed later
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Processing failed and will never succeed
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// A bug or broken invariant
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl HandlerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HandlerError::Invalid(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        HandlerError::Unexpected(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HandlerError::Invalid(_) | HandlerError::Permanent(_) => ErrorCategory::Permanent,
            HandlerError::Transient(_) => ErrorCategory::Transient,
            HandlerError::Unexpected(_) => ErrorCategory::Unexpected,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_categories() {
        assert_eq!(HandlerError::invalid("x").category(), ErrorCategory::Permanent);
        assert_eq!(HandlerError::permanent("x").category(), ErrorCategory::Permanent);
        assert_eq!(HandlerError::transient("x").category(), ErrorCategory::Transient);
        assert_eq!(HandlerError::unexpected("x").category(), ErrorCategory::Unexpected);
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(HandlerError::transient("smtp timeout").should_retry());
        assert!(!HandlerError::invalid("bad email").should_retry());
        assert!(!HandlerError::unexpected("panic").should_retry());
    }

    #[test]
    fn test_closed_counts_as_connection_error() {
        assert!(WorkerError::Closed.is_connection_error());
        assert!(WorkerError::Closed.is_closed());
        assert!(!WorkerError::transport("queue full").is_connection_error());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: WorkerError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, WorkerError::Serialization(_)));
    }
}
