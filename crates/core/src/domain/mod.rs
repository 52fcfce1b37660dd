// Domain Layer - Pure business logic and entities

pub mod backoff;
pub mod error;
pub mod event;
pub mod job;
pub mod options;
pub mod repeat;

// Re-exports
pub use backoff::{BackoffStrategies, CustomBackoff};
pub use error::{DomainError, MAX_PRIORITY};
pub use event::{EventKind, QueueEvent};
pub use job::{Job, JobId, JobState, ParentRef};
pub use options::{
    BackoffOptions, JobOptions, KeepPolicy, QueueOptions, QueueSettings, RateLimiterOptions,
    RepeatKeyHashAlgorithm, RepeatOptions, WorkerOptions,
};
pub use repeat::{RepeatStrategy, RepeatableDefinition, RepeatableListItem};
