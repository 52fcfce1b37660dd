// Worker - fetch loop, lock renewal, stalled recovery, graceful shutdown

pub mod constants;
mod shutdown;
mod stalled;

use constants::*;
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::queue::Queue;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::scheduler::{occurrence_fire_millis, JobScheduler};
use crate::domain::backoff::BackoffStrategies;
use crate::domain::{Job, JobId, WorkerOptions};
use crate::error::Result;
use crate::port::store::{Fetched, QueueStore, RetryDirective};
use crate::port::TimeProvider;

/// Why a handler did not return a value.
#[derive(Debug)]
pub enum ProcessError {
    /// Handler failure; the retry policy decides re-queue vs terminal
    Failed {
        message: String,
        stacktrace: Option<String>,
        /// Bypass retries even when attempts remain
        discard: bool,
    },
    /// Engage the rate limiter and put the job back for later
    RateLimited { duration_ms: i64 },
    /// Suspend the job until the given timestamp
    Delayed { until: i64 },
}

impl ProcessError {
    pub fn failed(message: impl Into<String>) -> Self {
        ProcessError::Failed {
            message: message.into(),
            stacktrace: None,
            discard: false,
        }
    }
}

/// Handle given to processors for in-flight job interaction.
#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    token: String,
    store: Arc<dyn QueueStore>,
}

impl JobContext {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Lock token owning this processing
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn update_progress(&self, progress: serde_json::Value) -> Result<()> {
        self.store.update_progress(&self.job_id, &progress).await
    }

    pub async fn log(&self, row: &str, keep_logs: Option<usize>) -> Result<u64> {
        self.store.append_log(&self.job_id, row, keep_logs).await
    }

    /// Park the job in waiting-children when it gained dependencies during
    /// processing. Returns false (and keeps the job active) when every
    /// dependency is already resolved.
    pub async fn move_to_waiting_children(&self) -> Result<bool> {
        self.store
            .move_to_waiting_children(&self.job_id, &self.token)
            .await
    }
}

/// Job handler. Returning a value completes the job; returning an error is
/// converted via the retry policy. Handlers are cancelled cooperatively at
/// their await points when the lock is lost or `close(true)` abandons them.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        job: Job,
        ctx: JobContext,
    ) -> std::result::Result<serde_json::Value, ProcessError>;
}

/// Worker processes jobs from one queue with bounded concurrency.
pub struct Worker {
    queue_name: String,
    store: Arc<dyn QueueStore>,
    processor: Arc<dyn Processor>,
    opts: WorkerOptions,
    retry_policy: RetryPolicy,
    scheduler: Arc<JobScheduler>,
    time_provider: Arc<dyn TimeProvider>,
    concurrency: AtomicUsize,
    worker_id: String,
    token_seq: AtomicUsize,
    shutdown: ShutdownSender,
    shutdown_token: ShutdownToken,
    force_close: AtomicBool,
    main_task: std::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Worker {
    /// Create a worker over `queue`. With `autorun` (the default) the fetch
    /// loop starts immediately; otherwise call [`Worker::run`].
    pub fn new(
        queue: &Queue,
        processor: Arc<dyn Processor>,
        opts: WorkerOptions,
        backoff_strategies: BackoffStrategies,
    ) -> Arc<Self> {
        let (shutdown, shutdown_token) = shutdown_channel();
        let worker = Arc::new(Self {
            queue_name: queue.name().to_string(),
            store: queue.store().clone(),
            processor,
            concurrency: AtomicUsize::new(opts.concurrency.max(1)),
            retry_policy: RetryPolicy::new(backoff_strategies),
            scheduler: queue.scheduler(),
            time_provider: queue.time_provider(),
            worker_id: Uuid::new_v4().to_string(),
            token_seq: AtomicUsize::new(0),
            shutdown,
            shutdown_token,
            force_close: AtomicBool::new(false),
            main_task: std::sync::Mutex::new(None),
            opts,
        });
        if worker.opts.autorun {
            let handle = tokio::spawn(worker.clone().run());
            *worker.main_task.lock().unwrap() = Some(handle);
        }
        worker
    }

    /// Change the in-flight bound; picked up on the next fetch cycle.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.concurrency
            .store(concurrency.max(1), Ordering::SeqCst);
    }

    /// Stop fetching and wait for in-flight processings. `force` abandons
    /// them instead; abandoned jobs stall and are recovered.
    pub async fn close(&self, force: bool) {
        self.force_close.store(force, Ordering::SeqCst);
        self.shutdown.shutdown();
        let handle = self.main_task.lock().unwrap().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker loop ended with error"),
                Err(e) => error!(error = %e, "Worker loop panicked"),
            }
        }
    }

    /// Run the fetch loop until `close` is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(queue = %self.queue_name, "Worker started");
        let mut shutdown = self.shutdown_token.clone();

        let stalled_checker = if self.opts.skip_stalled_check {
            None
        } else {
            Some(stalled::spawn_stalled_checker(
                self.store.clone(),
                self.opts.max_stalled_count,
                self.opts.stalled_interval,
                shutdown.clone(),
            ))
        };

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            if shutdown.is_shutdown() {
                break;
            }
            while tasks.try_join_next().is_some() {}

            // Mutable concurrency is re-read each cycle
            if tasks.len() >= self.concurrency.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tasks.join_next() => {}
                }
                continue;
            }

            let token = self.next_token();
            let fetched = self
                .store
                .move_to_active(&token, self.opts.lock_duration, self.opts.limiter.as_ref())
                .await;
            match fetched {
                Ok(Fetched::Job(job)) => {
                    let this = self.clone();
                    let job_shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        this.process_chain(*job, token, job_shutdown).await;
                    });
                }
                Ok(Fetched::RateLimited { limit_until }) => {
                    let now = self.time_provider.now_millis();
                    self.idle(&mut shutdown, limit_until - now).await;
                }
                Ok(Fetched::DelayedUntil { delay_until }) => {
                    let now = self.time_provider.now_millis();
                    let timeout = (delay_until - now).min(self.opts.drain_delay);
                    self.block_for_job(&mut shutdown, timeout).await;
                }
                Ok(Fetched::Empty) => {
                    self.block_for_job(&mut shutdown, self.opts.drain_delay).await;
                }
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "Fetch failed");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(ERROR_RECOVERY_SLEEP_DURATION) => {}
                    }
                }
            }
        }

        if self.force_close.load(Ordering::SeqCst) {
            // Abandoned jobs stall and are picked up by the stalled checker
            tasks.abort_all();
        }
        while tasks.join_next().await.is_some() {}

        if let Some(checker) = stalled_checker {
            let _ = checker.await;
        }
        info!(queue = %self.queue_name, "Worker stopped");
        Ok(())
    }

    /// Process one claimed job, then any jobs chained off completion.
    async fn process_chain(self: Arc<Self>, mut job: Job, token: String, shutdown: ShutdownToken) {
        loop {
            match self.process_one(job, &token, &shutdown).await {
                Some(next) => job = next,
                None => break,
            }
        }
    }

    async fn process_one(
        &self,
        job: Job,
        token: &str,
        shutdown: &ShutdownToken,
    ) -> Option<Job> {
        debug!(queue = %self.queue_name, job_id = %job.id, "Processing job");

        // Scheduler series advance on each occurrence delivery
        if let Some(key) = job.repeat_job_key.clone() {
            if let Some(fired) = occurrence_fire_millis(&job.id) {
                if let Err(e) = self.scheduler.advance(&key, fired).await {
                    error!(job_id = %job.id, error = %e, "Scheduler advance failed");
                }
            }
        }

        let ctx = JobContext {
            job_id: job.id.clone(),
            token: token.to_string(),
            store: self.store.clone(),
        };

        let outcome = self.run_handler(&job, ctx, token).await;
        let fetch_next = !shutdown.is_shutdown();

        match outcome {
            HandlerOutcome::LockLost => {
                // The stalled checker owns the job now; report nothing
                warn!(job_id = %job.id, "Lock lost during processing, abandoning");
                None
            }
            HandlerOutcome::Finished(Ok(returnvalue)) => {
                let result = self
                    .store
                    .move_to_completed(
                        &job.id,
                        &returnvalue,
                        token,
                        &job.opts.remove_on_complete,
                        fetch_next,
                        self.opts.lock_duration,
                        self.opts.limiter.as_ref(),
                    )
                    .await;
                match result {
                    Ok(next) => {
                        info!(queue = %self.queue_name, job_id = %job.id, "Job completed");
                        next.map(|boxed| *boxed)
                    }
                    Err(e) if e.is_lock_lost() => {
                        warn!(job_id = %job.id, "Lock lost before completion could be recorded");
                        None
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "moveToCompleted failed");
                        None
                    }
                }
            }
            HandlerOutcome::Finished(Err(ProcessError::Failed {
                message,
                stacktrace,
                discard,
            })) => {
                self.report_failure(&job, &message, stacktrace.as_deref(), discard, token, fetch_next)
                    .await
            }
            HandlerOutcome::Finished(Err(ProcessError::RateLimited { duration_ms })) => {
                if let Err(e) = self.store.rate_limit(duration_ms).await {
                    error!(error = %e, "Manual rate limit failed");
                }
                let fire_at = self.time_provider.now_millis() + duration_ms;
                if let Err(e) = self.store.move_to_delayed(&job.id, fire_at, token).await {
                    if !e.is_lock_lost() {
                        error!(job_id = %job.id, error = %e, "moveToDelayed failed");
                    }
                }
                None
            }
            HandlerOutcome::Finished(Err(ProcessError::Delayed { until })) => {
                if let Err(e) = self.store.move_to_delayed(&job.id, until, token).await {
                    if !e.is_lock_lost() {
                        error!(job_id = %job.id, error = %e, "moveToDelayed failed");
                    }
                }
                None
            }
        }
    }

    /// Drive the handler, renewing the lock on a timer independent of the
    /// handler's execution. A failed renewal cancels the handler locally.
    async fn run_handler(&self, job: &Job, ctx: JobContext, token: &str) -> HandlerOutcome {
        let handler = self.processor.process(job.clone(), ctx);
        tokio::pin!(handler);

        if self.opts.skip_lock_renewal {
            return HandlerOutcome::Finished(handler.await);
        }

        let renew_every = Duration::from_millis(self.opts.lock_renew_time().max(1) as u64);
        let mut renewal = tokio::time::interval_at(
            tokio::time::Instant::now() + renew_every,
            renew_every,
        );
        loop {
            tokio::select! {
                result = &mut handler => return HandlerOutcome::Finished(result),
                _ = renewal.tick() => {
                    match self
                        .store
                        .extend_lock(&job.id, token, self.opts.lock_duration)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => return HandlerOutcome::LockLost,
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "Lock renewal errored");
                            return HandlerOutcome::LockLost;
                        }
                    }
                }
            }
        }
    }

    async fn report_failure(
        &self,
        job: &Job,
        message: &str,
        stacktrace: Option<&str>,
        discard: bool,
        token: &str,
        fetch_next: bool,
    ) -> Option<Job> {
        let attempts_made = job.attempts_made + 1;
        let directive = match self
            .retry_policy
            .decide(job, attempts_made, Some(message), discard)
        {
            Ok(RetryDecision::Retry(delay_ms)) => RetryDirective {
                retry: true,
                delay_ms,
            },
            Ok(RetryDecision::Failed) => RetryDirective::terminal(),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Backoff resolution failed");
                RetryDirective::terminal()
            }
        };

        let result = self
            .store
            .move_to_failed(
                &job.id,
                message,
                stacktrace,
                token,
                &job.opts.remove_on_fail,
                directive,
                fetch_next,
                self.opts.lock_duration,
                self.opts.limiter.as_ref(),
            )
            .await;
        match result {
            Ok(next) => {
                warn!(
                    queue = %self.queue_name,
                    job_id = %job.id,
                    retry = %directive.retry,
                    "Job failed"
                );
                next.map(|boxed| *boxed)
            }
            Err(e) if e.is_lock_lost() => {
                warn!(job_id = %job.id, "Lock lost before failure could be recorded");
                None
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "moveToFailed failed");
                None
            }
        }
    }

    async fn idle(&self, shutdown: &mut ShutdownToken, duration_ms: i64) {
        let duration = Duration::from_millis(duration_ms.max(MIN_BLOCK_DURATION_MS) as u64);
        tokio::select! {
            _ = shutdown.wait() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn block_for_job(&self, shutdown: &mut ShutdownToken, timeout_ms: i64) {
        let timeout_ms = timeout_ms.max(MIN_BLOCK_DURATION_MS);
        tokio::select! {
            _ = shutdown.wait() => {}
            result = self.store.wait_for_job(timeout_ms) => {
                if let Err(e) = result {
                    error!(error = %e, "Blocking wait failed");
                    tokio::time::sleep(ERROR_RECOVERY_SLEEP_DURATION).await;
                }
            }
        }
    }

    fn next_token(&self) -> String {
        let seq = self.token_seq.fetch_add(1, Ordering::SeqCst);
        format!("{}:{}", self.worker_id, seq)
    }
}

enum HandlerOutcome {
    Finished(std::result::Result<serde_json::Value, ProcessError>),
    LockLost,
}
