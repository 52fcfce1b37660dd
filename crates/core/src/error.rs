// Central Error Type for the Application

use thiserror::Error;

use crate::domain::DomainError;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Transient store failure (connection drop, script load, redirection)
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Typed outcomes of the store scripts; the worker branches on these
    #[error("Missing key for job {0}")]
    MissingJob(String),

    #[error("Missing lock for job {0}")]
    MissingLock(String),

    #[error("Lock mismatch for job {0}")]
    LockMismatch(String),

    #[error("Job {id} is not in the {expected} state")]
    WrongState { id: String, expected: String },

    #[error("Missing key for parent job of job {0}")]
    MissingParent(String),

    #[error("Job {0} has pending dependencies")]
    PendingDependencies(String),

    #[error("Unexpected script return code {code} for job {id}")]
    UnexpectedCode { id: String, code: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// A lost or mismatched lock means the stalled checker owns the job now;
    /// the worker must not report completion or failure for it.
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, AppError::MissingLock(_) | AppError::LockMismatch(_))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// From implementation for infra crates (to avoid circular dependency)
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Store(err)
    }
}

// Note: redis::RedisError conversion is handled in the infra-redis crate
// by converting to AppError::Store(String)
