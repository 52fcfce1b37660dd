// Domain errors - contract violations fail fast, before any store mutation

use thiserror::Error;

/// Highest priority value a job may carry (21 bits).
pub const MAX_PRIORITY: u32 = (1 << 21) - 1;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("End date must be greater than current timestamp")]
    EndDateInPast,

    #[error("Both .pattern and .every options are defined for this repeatable job")]
    ConflictingRepeatOptions,

    #[error("Job {0} belongs to a job scheduler and cannot be removed directly. remove")]
    SchedulerOwnedJob(String),

    #[error("Priority should be between 0 and {MAX_PRIORITY}")]
    PriorityOutOfRange,

    #[error("DTSTART must be defined to use COUNT with rrule")]
    MissingDtStart,

    #[error("Invalid cron pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Custom backoff strategy {0} is not registered")]
    UnknownBackoffStrategy(String),
}

/// Result type alias for domain-level validation
pub type Result<T> = std::result::Result<T, DomainError>;
