// Application Layer - Use Cases and Services

pub mod events;
pub mod flow;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub mod test_support;

// Re-exports
pub use events::QueueEvents;
pub use flow::{FlowJob, FlowNodeIds, FlowProducer};
pub use queue::Queue;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::JobScheduler;
pub use worker::{
    shutdown_channel, JobContext, ProcessError, Processor, ShutdownSender, ShutdownToken, Worker,
};
