// Error handling framework

use thiserror::Error;

/// Cron expression parsing and evaluation errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    #[error("No upcoming occurrence for cron expression '{expression}' within the search horizon")]
    NoUpcomingOccurrence { expression: String },

    #[error("Schedule calculation failed: {0}")]
    CalculationFailed(String),
}

/// Schedule table load-time validation errors
///
/// Any of these is fatal to startup: the process must not run with an
/// invalid table.
#[derive(Error, Debug)]
pub enum TableError {
    #[error("Task key cannot be empty")]
    EmptyKey,

    #[error("Duplicate task key '{0}'")]
    DuplicateKey(String),

    #[error("Task '{key}' has an invalid cron expression")]
    InvalidCronExpression {
        key: String,
        #[source]
        source: ScheduleError,
    },

    #[error("Task '{key}' has an empty job class")]
    EmptyJobClass { key: String },

    #[error("Task '{key}' has an invalid priority: {reason}")]
    InvalidPriority { key: String, reason: String },
}

/// Dedup guard errors
///
/// A duplicate fire is NOT an error; it is a normal `Admission::Duplicate`
/// outcome. This enum only covers the backing store being unusable.
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Dedup store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Errors from the execution engine's enqueue interface
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Failed to connect to execution engine: {0}")]
    Connection(String),

    #[error("Enqueue rejected by execution engine: {0}")]
    Rejected(String),

    #[error("Request serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Enqueue acknowledgment timeout: {0}")]
    AckTimeout(String),
}

/// Dispatch failure after the bounded within-tick retry budget
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Dispatch for task '{key}' failed after {attempts} attempts")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: EnqueueError,
    },
}

impl From<redis::RedisError> for DedupError {
    fn from(err: redis::RedisError) -> Self {
        DedupError::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = ScheduleError::InvalidExpression {
            expression: "* * * *".to_string(),
            reason: "expected 5 or 6 fields, got 4".to_string(),
        };
        assert!(err.to_string().contains("Invalid cron expression"));
        assert!(err.to_string().contains("* * * *"));
    }

    #[test]
    fn test_table_error_carries_key() {
        let err = TableError::DuplicateKey("frequent_task".to_string());
        assert!(err.to_string().contains("frequent_task"));
    }

    #[test]
    fn test_dispatch_error_source_is_preserved() {
        use std::error::Error;

        let err = DispatchError::RetriesExhausted {
            key: "a".to_string(),
            attempts: 3,
            source: EnqueueError::Rejected("stream full".to_string()),
        };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.source().is_some());
    }
}
