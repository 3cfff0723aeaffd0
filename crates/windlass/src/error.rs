//! Queue error types.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced by the queue system.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Redis command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Handler reported a failure.
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Validation error (bad cron expression, bad priority level, bad
    /// progress value, bad option combination). No state was mutated.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid cron expression.
    #[error("Invalid cron expression: {0}")]
    InvalidCron(String),

    /// Configuration error surfaced at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Lock could not be acquired within its retry budget.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    /// Worker loop error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Cluster coordination error (leader election, work distribution).
    /// Treated as transient; the next cycle recovers.
    #[error("Coordination error: {0}")]
    Coordination(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Returns true if the operation that produced this error is worth
    /// retrying on a later cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Redis(_)
                | QueueError::Pool(_)
                | QueueError::Handler(_)
                | QueueError::Worker(_)
                | QueueError::Coordination(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_is_retryable() {
        let err = QueueError::Handler("boom".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_coordination_error_is_retryable() {
        let err = QueueError::Coordination("split brain".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_error_is_not_retryable() {
        let err = QueueError::Validation("progress out of range".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_configuration_error_is_not_retryable() {
        let err = QueueError::Configuration("missing url".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_cron_is_not_retryable() {
        let err = QueueError::InvalidCron("61 * * * *".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display_contains_detail() {
        let err = QueueError::JobNotFound("job-42".into());
        assert!(err.to_string().contains("job-42"));
    }
}
