// Queue service - the producing and management surface over the store scripts

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::scheduler::JobScheduler;
use crate::domain::repeat::RepeatStrategy;
use crate::domain::{
    DomainError, Job, JobId, JobOptions, JobState, QueueOptions, RepeatableListItem,
};
use crate::error::{AppError, Result};
use crate::port::store::{AddedJob, QueueStore};
use crate::port::TimeProvider;

/// A handle on one named queue. All shared state lives in the store; this
/// type holds only configuration and the store port.
pub struct Queue {
    name: String,
    store: Arc<dyn QueueStore>,
    time_provider: Arc<dyn TimeProvider>,
    opts: QueueOptions,
    scheduler: Arc<JobScheduler>,
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn QueueStore>,
        time_provider: Arc<dyn TimeProvider>,
        opts: QueueOptions,
        repeat_strategy: Option<RepeatStrategy>,
    ) -> Self {
        let scheduler = Arc::new(JobScheduler::new(
            store.clone(),
            time_provider.clone(),
            opts.settings.repeat_key_hash_algorithm,
            repeat_strategy,
        ));
        Self {
            name: name.into(),
            store,
            time_provider,
            opts,
            scheduler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualified queue key, `<prefix>:<queueName>`
    pub fn queue_key(&self) -> &str {
        self.store.queue_key()
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn scheduler(&self) -> Arc<JobScheduler> {
        self.scheduler.clone()
    }

    pub fn time_provider(&self) -> Arc<dyn TimeProvider> {
        self.time_provider.clone()
    }

    pub fn default_job_options(&self) -> &JobOptions {
        &self.opts.default_job_options
    }

    /// Enqueue one job. Repeat options route through the job scheduler;
    /// everything else lands in exactly one state set via the add script.
    pub async fn add(
        &self,
        name: &str,
        data: serde_json::Value,
        opts: Option<JobOptions>,
    ) -> Result<AddedJob> {
        let opts = opts.unwrap_or_else(|| self.opts.default_job_options.clone());
        let now = self.time_provider.now_millis();
        opts.validate(now)?;

        if let Some(repeat) = &opts.repeat {
            let added = self
                .scheduler
                .upsert(name, &data, repeat, &opts)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("No next occurrence for repeatable job {}", name))
                })?;
            return Ok(added);
        }

        let job = Job::new(name, data, opts, now);
        let added = self.store.add_job(&job).await?;
        if let AddedJob::Duplicated(id) = &added {
            warn!(queue = %self.name, job_id = %id, "Duplicate job id, add was a no-op");
        }
        Ok(added)
    }

    /// Enqueue a batch with one script call, preserving the batch's FIFO
    /// order. Repeat options are not allowed in bulk adds.
    pub async fn add_bulk(
        &self,
        entries: Vec<(String, serde_json::Value, Option<JobOptions>)>,
    ) -> Result<Vec<AddedJob>> {
        let now = self.time_provider.now_millis();
        let mut jobs = Vec::with_capacity(entries.len());
        for (name, data, opts) in entries {
            let opts = opts.unwrap_or_else(|| self.opts.default_job_options.clone());
            opts.validate(now)?;
            jobs.push(Job::new(name, data, opts, now));
        }
        self.store.add_bulk(&jobs).await
    }

    pub async fn pause(&self) -> Result<()> {
        info!(queue = %self.name, "Pausing queue");
        self.store.pause(true).await
    }

    pub async fn resume(&self) -> Result<()> {
        info!(queue = %self.name, "Resuming queue");
        self.store.pause(false).await
    }

    /// Move a delayed job immediately to wait/prioritized.
    pub async fn promote(&self, id: &JobId) -> Result<()> {
        self.store.promote(id).await
    }

    /// Client-driven retry of a completed or failed job.
    pub async fn retry_job(&self, id: &JobId, from: JobState) -> Result<()> {
        self.store.retry_job(id, from).await
    }

    /// Remove a job. Jobs owned by a scheduler must be removed through the
    /// scheduler; jobs in `active` are rejected by the script.
    pub async fn remove(&self, id: &JobId) -> Result<bool> {
        if let Some(job) = self.store.get_job(id).await? {
            if job.repeat_job_key.is_some() {
                return Err(DomainError::SchedulerOwnedJob(id.clone()).into());
            }
        }
        self.store.remove_job(id).await
    }

    /// Remove terminal jobs older than `grace_ms`, up to `limit` of them.
    pub async fn clean(&self, grace_ms: i64, limit: u64, state: JobState) -> Result<Vec<JobId>> {
        self.store.clean(grace_ms, limit, state).await
    }

    /// Empty wait/paused (and optionally delayed).
    pub async fn drain(&self, include_delayed: bool) -> Result<()> {
        self.store.drain(include_delayed).await
    }

    /// Delete every key of the queue. Refuses while jobs are active unless
    /// `force` is set.
    pub async fn obliterate(&self, force: bool) -> Result<()> {
        warn!(queue = %self.name, force = %force, "Obliterating queue");
        self.store.obliterate(force).await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get_job(id).await
    }

    pub async fn get_state(&self, id: &JobId) -> Result<Option<JobState>> {
        self.store.get_state(id).await
    }

    pub async fn get_counts(
        &self,
        states: &[JobState],
    ) -> Result<std::collections::HashMap<JobState, u64>> {
        self.store.get_counts(states).await
    }

    /// List jobs in one state; `asc` orders by dispatch/finish order and
    /// `limit < 0` returns the whole range.
    pub async fn get_jobs(
        &self,
        state: JobState,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<Job>> {
        self.store.list_jobs(state, offset, limit, asc).await
    }

    pub async fn update_progress(&self, id: &JobId, progress: serde_json::Value) -> Result<()> {
        self.store.update_progress(id, &progress).await
    }

    /// Append a log row to the job, bounded by `keepLogs`.
    pub async fn log(&self, id: &JobId, row: &str, keep_logs: Option<usize>) -> Result<u64> {
        self.store.append_log(id, row, keep_logs).await
    }

    pub async fn change_priority(&self, id: &JobId, priority: u32, lifo: bool) -> Result<()> {
        if priority > crate::domain::MAX_PRIORITY {
            return Err(DomainError::PriorityOutOfRange.into());
        }
        self.store.change_priority(id, priority, lifo).await
    }

    pub async fn get_repeatable_jobs(
        &self,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<RepeatableListItem>> {
        self.scheduler.list(offset, limit, asc).await
    }

    pub async fn remove_repeatable(
        &self,
        name: &str,
        repeat: &crate::domain::RepeatOptions,
    ) -> Result<bool> {
        self.scheduler.remove(name, repeat).await
    }

    pub async fn remove_repeatable_by_key(&self, key: &str) -> Result<bool> {
        self.scheduler.remove_by_key(key).await
    }
}
