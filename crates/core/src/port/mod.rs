// Port Layer - Interfaces for external dependencies

pub mod store;
pub mod time_provider;

// Re-exports
pub use store::{
    AddedJob, Fetched, FlowNodePlan, QueueStore, RetryDirective, StalledSweep, StoreCode,
    StoredRepeatable,
};
pub use time_provider::{FixedTimeProvider, SystemTimeProvider, TimeProvider};
