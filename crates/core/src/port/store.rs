// Queue Store Port (Interface)
//
// Every mutating operation that touches more than one key executes as a
// single atomic script on the store; this trait is the typed surface over
// those scripts.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::domain::{
    Job, JobId, JobState, KeepPolicy, QueueEvent, RateLimiterOptions, RepeatableDefinition,
    RepeatableListItem,
};
use crate::error::{AppError, Result};

/// Discriminated integer codes returned by the store scripts. The numeric
/// values are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum StoreCode {
    Ok = 0,
    JobNotFound = -1,
    WrongState = -2,
    LockMismatch = -3,
    PendingDependencies = -4,
    LockMissing = -5,
    ParentMissing = -6,
}

impl StoreCode {
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            0 => Some(StoreCode::Ok),
            -1 => Some(StoreCode::JobNotFound),
            -2 => Some(StoreCode::WrongState),
            -3 => Some(StoreCode::LockMismatch),
            -4 => Some(StoreCode::PendingDependencies),
            -5 => Some(StoreCode::LockMissing),
            -6 => Some(StoreCode::ParentMissing),
            _ => None,
        }
    }

    /// Map a non-ok code to the typed error for `job_id`.
    pub fn into_error(self, job_id: &str, expected: &str) -> AppError {
        match self {
            StoreCode::Ok => AppError::Internal(format!(
                "ok code treated as error for job {}",
                job_id
            )),
            StoreCode::JobNotFound => AppError::MissingJob(job_id.to_string()),
            StoreCode::WrongState => AppError::WrongState {
                id: job_id.to_string(),
                expected: expected.to_string(),
            },
            StoreCode::LockMismatch => AppError::LockMismatch(job_id.to_string()),
            StoreCode::PendingDependencies => AppError::PendingDependencies(job_id.to_string()),
            StoreCode::LockMissing => AppError::MissingLock(job_id.to_string()),
            StoreCode::ParentMissing => AppError::MissingParent(job_id.to_string()),
        }
    }
}

/// Outcome of an `add` script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddedJob {
    Created(JobId),
    /// Caller-supplied id already existed; the add was a no-op
    Duplicated(JobId),
}

impl AddedJob {
    pub fn id(&self) -> &str {
        match self {
            AddedJob::Created(id) | AddedJob::Duplicated(id) => id,
        }
    }
}

/// Outcome of a `moveToActive` dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// A job was claimed; its lock is held under the worker's token
    Job(Box<Job>),
    /// The rate limit window is saturated until the given time
    RateLimited { limit_until: i64 },
    /// Nothing ready; the head of `delayed` fires at the given time
    DelayedUntil { delay_until: i64 },
    /// Queue empty (or paused)
    Empty,
}

/// Client-computed retry decision applied by `moveToFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDirective {
    /// Re-queue instead of finishing
    pub retry: bool,
    /// Backoff delay in ms when retrying
    pub delay_ms: i64,
}

impl RetryDirective {
    pub fn terminal() -> Self {
        Self {
            retry: false,
            delay_ms: 0,
        }
    }
}

/// One node of a flow tree, prepared for atomic insertion. Children carry
/// parent refs inside their job; parents list their direct children here.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowNodePlan {
    /// Queue the node lands on (flows may span queues under one prefix)
    pub queue_name: String,
    pub job: Job,
    /// Qualified job keys of the node's direct children; non-empty places
    /// the node into `waiting-children`
    pub pending_children: Vec<String>,
}

/// A repeatable definition together with the fire time of its outstanding
/// occurrence (the `repeat` zset score), when one exists.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRepeatable {
    pub def: RepeatableDefinition,
    pub outstanding: Option<i64>,
}

/// Result of one stalled sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StalledSweep {
    /// Jobs requeued into `wait`
    pub stalled: Vec<JobId>,
    /// Jobs that exceeded `maxStalledCount` and were failed
    pub failed: Vec<JobId>,
}

/// Store interface for a single queue. Implementations own the key layout
/// and the script runtime; callers never see raw keys.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Queue key, `<prefix>:<queueName>`. Used in cross-queue parent refs.
    fn queue_key(&self) -> &str;

    // ---- producing ----

    /// Write the job hash and place the id into exactly one state set.
    async fn add_job(&self, job: &Job) -> Result<AddedJob>;

    /// Batch add preserving the relative FIFO order of the batch.
    async fn add_bulk(&self, jobs: &[Job]) -> Result<Vec<AddedJob>>;

    /// Insert a whole flow tree atomically, parents before children.
    async fn add_flow(&self, nodes: &[FlowNodePlan]) -> Result<Vec<AddedJob>>;

    // ---- dispatching ----

    /// Claim the next ready job under the worker's token.
    async fn move_to_active(
        &self,
        token: &str,
        lock_duration_ms: i64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Fetched>;

    /// Record success; optionally claim the next job in the same script.
    #[allow(clippy::too_many_arguments)]
    async fn move_to_completed(
        &self,
        id: &JobId,
        returnvalue: &serde_json::Value,
        token: &str,
        remove_policy: &KeepPolicy,
        fetch_next: bool,
        lock_duration_ms: i64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<Box<Job>>>;

    /// Record failure; `directive` decides between re-queue and terminal.
    #[allow(clippy::too_many_arguments)]
    async fn move_to_failed(
        &self,
        id: &JobId,
        reason: &str,
        stacktrace_line: Option<&str>,
        token: &str,
        remove_policy: &KeepPolicy,
        directive: RetryDirective,
        fetch_next: bool,
        lock_duration_ms: i64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<Box<Job>>>;

    /// Lock-checked transition from active to delayed.
    async fn move_to_delayed(&self, id: &JobId, fire_at_millis: i64, token: &str) -> Result<()>;

    /// Transition to waiting-children when unresolved dependencies remain.
    /// Returns false when all dependencies were already resolved.
    async fn move_to_waiting_children(&self, id: &JobId, token: &str) -> Result<bool>;

    /// Renew the lock iff the stored token matches. Returns false otherwise.
    async fn extend_lock(&self, id: &JobId, token: &str, duration_ms: i64) -> Result<bool>;

    // ---- queue management ----

    /// Client-driven retry of a completed or failed job.
    async fn retry_job(&self, id: &JobId, from: JobState) -> Result<()>;

    /// Remove a job entirely. The script rejects jobs in `active`.
    async fn remove_job(&self, id: &JobId) -> Result<bool>;

    /// Move a delayed job immediately to wait/prioritized.
    async fn promote(&self, id: &JobId) -> Result<()>;

    /// Swap wait and paused; dispatch respects the paused flag.
    async fn pause(&self, paused: bool) -> Result<()>;

    /// Empty wait/paused (and optionally delayed), emitting `drained`.
    async fn drain(&self, include_delayed: bool) -> Result<()>;

    /// Remove terminal jobs older than `grace_ms`, up to `limit`.
    async fn clean(&self, grace_ms: i64, limit: u64, state: JobState) -> Result<Vec<JobId>>;

    /// Delete all keys of the queue. Refuses when actives exist unless forced.
    async fn obliterate(&self, force: bool) -> Result<()>;

    /// Manually engage the rate limiter for `duration_ms`.
    async fn rate_limit(&self, duration_ms: i64) -> Result<()>;

    // ---- job accessors ----

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>>;

    async fn get_state(&self, id: &JobId) -> Result<Option<JobState>>;

    async fn get_counts(&self, states: &[JobState]) -> Result<HashMap<JobState, u64>>;

    /// List jobs in one state. `asc` orders by dispatch/finish order,
    /// `limit < 0` returns the whole range. `active` has no defined order.
    async fn list_jobs(
        &self,
        state: JobState,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<Job>>;

    /// Write the `progress` field and emit a `progress` event.
    async fn update_progress(&self, id: &JobId, progress: &serde_json::Value) -> Result<()>;

    /// Append a log row, bounded by `keep_logs`. Returns the row count.
    async fn append_log(&self, id: &JobId, row: &str, keep_logs: Option<usize>) -> Result<u64>;

    async fn change_priority(&self, id: &JobId, priority: u32, lifo: bool) -> Result<()>;

    // ---- repeatable definitions ----

    /// Atomically replace any definition under the same key (and its
    /// outstanding occurrence) with the new definition plus first occurrence.
    /// `legacy_key` is also cleared when present in the old layout.
    async fn upsert_repeatable(
        &self,
        def: &RepeatableDefinition,
        occurrence: &Job,
        legacy_key: Option<&str>,
    ) -> Result<()>;

    /// Remove a definition and its outstanding occurrence; recognizes both
    /// the hashed and the legacy key shape. Returns whether anything existed.
    async fn remove_repeatable(&self, key: &str, legacy_key: Option<&str>) -> Result<bool>;

    async fn get_repeatable(&self, key: &str) -> Result<Option<StoredRepeatable>>;

    async fn list_repeatable(
        &self,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<RepeatableListItem>>;

    /// Advance the series. When `occurrence` is given and no job with its id
    /// exists yet, it is inserted as the outstanding delayed occurrence.
    /// `next` replaces the precomputed fire time the dispatcher script
    /// consumes on the next delivery (`None` terminates precomputation).
    async fn advance_repeatable(
        &self,
        key: &str,
        occurrence: Option<&Job>,
        next: Option<i64>,
    ) -> Result<()>;

    // ---- stalled recovery ----

    /// Probe the stalled-check lease and, when won, sweep `active` for jobs
    /// whose lock expired. Returns `None` when another worker holds the lease.
    async fn check_stalled_jobs(
        &self,
        max_stalled_count: u32,
        stalled_interval_ms: i64,
    ) -> Result<Option<StalledSweep>>;

    // ---- events & blocking waits ----

    /// Block until a job may be ready, bounded by `timeout_ms`. Uses the
    /// marker on a dedicated blocking connection.
    async fn wait_for_job(&self, timeout_ms: i64) -> Result<()>;

    /// Read events from the capped stream starting after `cursor`
    /// (exclusive). Blocks up to `block_ms` when the stream is caught up.
    async fn read_events(
        &self,
        cursor: &str,
        block_ms: i64,
        count: usize,
    ) -> Result<Vec<QueueEvent>>;
}
