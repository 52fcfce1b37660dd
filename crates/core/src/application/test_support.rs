// In-memory QueueStore used by the application-layer unit tests.
// Behavior is scripted per test: fetch outcomes, sweeps and event batches
// are queues the test preloads.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    Job, JobId, JobState, KeepPolicy, QueueEvent, RateLimiterOptions, RepeatableDefinition,
    RepeatableListItem,
};
use crate::error::Result;
use crate::port::store::{
    AddedJob, Fetched, FlowNodePlan, QueueStore, RetryDirective, StalledSweep, StoredRepeatable,
};

#[derive(Default)]
pub struct MockStore {
    queue_key: String,
    id_counter: AtomicU64,
    pub jobs: Mutex<HashMap<JobId, Job>>,
    pub added: Mutex<Vec<Job>>,
    pub flows: Mutex<Vec<Vec<FlowNodePlan>>>,
    pub fetches: Mutex<VecDeque<Fetched>>,
    pub completions: Mutex<Vec<(JobId, serde_json::Value)>>,
    pub failures: Mutex<Vec<(JobId, String, RetryDirective)>>,
    pub delayed_moves: Mutex<Vec<(JobId, i64)>>,
    pub extend_ok: AtomicBool,
    pub extends: Mutex<Vec<JobId>>,
    pub sweeps: Mutex<VecDeque<Option<StalledSweep>>>,
    pub repeatables: Mutex<HashMap<String, StoredRepeatable>>,
    pub upserts: Mutex<Vec<(RepeatableDefinition, Job, Option<String>)>>,
    pub advances: Mutex<Vec<(String, Option<Job>, Option<i64>)>>,
    pub removed_repeatables: Mutex<Vec<(String, Option<String>)>>,
    pub event_batches: Mutex<VecDeque<Vec<QueueEvent>>>,
    pub pause_calls: Mutex<Vec<bool>>,
    pub removed: Mutex<Vec<JobId>>,
    pub promoted: Mutex<Vec<JobId>>,
    pub rate_limits: Mutex<Vec<i64>>,
}

impl MockStore {
    pub fn new(queue_key: impl Into<String>) -> Self {
        Self {
            queue_key: queue_key.into(),
            extend_ok: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn push_fetch(&self, fetched: Fetched) {
        self.fetches.lock().unwrap().push_back(fetched);
    }

    pub fn push_sweep(&self, sweep: Option<StalledSweep>) {
        self.sweeps.lock().unwrap().push_back(sweep);
    }

    pub fn push_events(&self, batch: Vec<QueueEvent>) {
        self.event_batches.lock().unwrap().push_back(batch);
    }
}

#[async_trait]
impl QueueStore for MockStore {
    fn queue_key(&self) -> &str {
        &self.queue_key
    }

    async fn add_job(&self, job: &Job) -> Result<AddedJob> {
        let mut job = job.clone();
        if job.id.is_empty() {
            job.id = (self.id_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Ok(AddedJob::Duplicated(job.id));
        }
        let id = job.id.clone();
        jobs.insert(id.clone(), job.clone());
        self.added.lock().unwrap().push(job);
        Ok(AddedJob::Created(id))
    }

    async fn add_bulk(&self, jobs: &[Job]) -> Result<Vec<AddedJob>> {
        let mut out = Vec::with_capacity(jobs.len());
        for job in jobs {
            out.push(self.add_job(job).await?);
        }
        Ok(out)
    }

    async fn add_flow(&self, nodes: &[FlowNodePlan]) -> Result<Vec<AddedJob>> {
        self.flows.lock().unwrap().push(nodes.to_vec());
        let mut out = Vec::with_capacity(nodes.len());
        for node in nodes {
            out.push(self.add_job(&node.job).await?);
        }
        Ok(out)
    }

    async fn move_to_active(
        &self,
        _token: &str,
        _lock_duration_ms: i64,
        _limiter: Option<&RateLimiterOptions>,
    ) -> Result<Fetched> {
        Ok(self
            .fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Fetched::Empty))
    }

    async fn move_to_completed(
        &self,
        id: &JobId,
        returnvalue: &serde_json::Value,
        _token: &str,
        _remove_policy: &KeepPolicy,
        _fetch_next: bool,
        _lock_duration_ms: i64,
        _limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<Box<Job>>> {
        self.completions
            .lock()
            .unwrap()
            .push((id.clone(), returnvalue.clone()));
        Ok(None)
    }

    async fn move_to_failed(
        &self,
        id: &JobId,
        reason: &str,
        _stacktrace_line: Option<&str>,
        _token: &str,
        _remove_policy: &KeepPolicy,
        directive: RetryDirective,
        _fetch_next: bool,
        _lock_duration_ms: i64,
        _limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<Box<Job>>> {
        self.failures
            .lock()
            .unwrap()
            .push((id.clone(), reason.to_string(), directive));
        Ok(None)
    }

    async fn move_to_delayed(&self, id: &JobId, fire_at_millis: i64, _token: &str) -> Result<()> {
        self.delayed_moves
            .lock()
            .unwrap()
            .push((id.clone(), fire_at_millis));
        Ok(())
    }

    async fn move_to_waiting_children(&self, _id: &JobId, _token: &str) -> Result<bool> {
        Ok(true)
    }

    async fn extend_lock(&self, id: &JobId, _token: &str, _duration_ms: i64) -> Result<bool> {
        self.extends.lock().unwrap().push(id.clone());
        Ok(self.extend_ok.load(Ordering::SeqCst))
    }

    async fn retry_job(&self, _id: &JobId, _from: JobState) -> Result<()> {
        Ok(())
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool> {
        self.removed.lock().unwrap().push(id.clone());
        Ok(self.jobs.lock().unwrap().remove(id).is_some())
    }

    async fn promote(&self, id: &JobId) -> Result<()> {
        self.promoted.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        self.pause_calls.lock().unwrap().push(paused);
        Ok(())
    }

    async fn drain(&self, _include_delayed: bool) -> Result<()> {
        Ok(())
    }

    async fn clean(&self, _grace_ms: i64, _limit: u64, _state: JobState) -> Result<Vec<JobId>> {
        Ok(Vec::new())
    }

    async fn obliterate(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn rate_limit(&self, duration_ms: i64) -> Result<()> {
        self.rate_limits.lock().unwrap().push(duration_ms);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(id).cloned())
    }

    async fn get_state(&self, _id: &JobId) -> Result<Option<JobState>> {
        Ok(None)
    }

    async fn get_counts(&self, _states: &[JobState]) -> Result<HashMap<JobState, u64>> {
        Ok(HashMap::new())
    }

    async fn list_jobs(
        &self,
        _state: JobState,
        offset: i64,
        limit: i64,
        _asc: bool,
    ) -> Result<Vec<Job>> {
        let added = self.added.lock().unwrap();
        let skip = offset.max(0) as usize;
        let take = if limit < 0 { usize::MAX } else { limit as usize };
        Ok(added.iter().skip(skip).take(take).cloned().collect())
    }

    async fn update_progress(&self, _id: &JobId, _progress: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn append_log(&self, _id: &JobId, _row: &str, _keep_logs: Option<usize>) -> Result<u64> {
        Ok(1)
    }

    async fn change_priority(&self, _id: &JobId, _priority: u32, _lifo: bool) -> Result<()> {
        Ok(())
    }

    async fn upsert_repeatable(
        &self,
        def: &RepeatableDefinition,
        occurrence: &Job,
        legacy_key: Option<&str>,
    ) -> Result<()> {
        self.upserts.lock().unwrap().push((
            def.clone(),
            occurrence.clone(),
            legacy_key.map(str::to_string),
        ));
        self.repeatables.lock().unwrap().insert(
            def.key.clone(),
            StoredRepeatable {
                def: def.clone(),
                outstanding: Some(occurrence.delay_until()),
            },
        );
        self.jobs
            .lock()
            .unwrap()
            .insert(occurrence.id.clone(), occurrence.clone());
        Ok(())
    }

    async fn remove_repeatable(&self, key: &str, legacy_key: Option<&str>) -> Result<bool> {
        self.removed_repeatables
            .lock()
            .unwrap()
            .push((key.to_string(), legacy_key.map(str::to_string)));
        Ok(self.repeatables.lock().unwrap().remove(key).is_some())
    }

    async fn get_repeatable(&self, key: &str) -> Result<Option<StoredRepeatable>> {
        Ok(self.repeatables.lock().unwrap().get(key).cloned())
    }

    async fn list_repeatable(
        &self,
        _offset: i64,
        _limit: i64,
        _asc: bool,
    ) -> Result<Vec<RepeatableListItem>> {
        let repeatables = self.repeatables.lock().unwrap();
        Ok(repeatables
            .values()
            .map(|stored| RepeatableListItem {
                key: stored.def.key.clone(),
                name: stored.def.name.clone(),
                end_date: stored.def.opts.end_date,
                tz: stored.def.opts.tz.clone(),
                pattern: stored.def.opts.pattern.clone(),
                every: stored.def.opts.every,
                next: stored.outstanding.unwrap_or(0),
            })
            .collect())
    }

    async fn advance_repeatable(
        &self,
        key: &str,
        occurrence: Option<&Job>,
        next: Option<i64>,
    ) -> Result<()> {
        self.advances
            .lock()
            .unwrap()
            .push((key.to_string(), occurrence.cloned(), next));
        let mut repeatables = self.repeatables.lock().unwrap();
        if let Some(stored) = repeatables.get_mut(key) {
            stored.def.next = next;
            if let Some(occurrence) = occurrence {
                stored.def.count += 1;
                stored.outstanding = Some(occurrence.delay_until());
                self.jobs
                    .lock()
                    .unwrap()
                    .insert(occurrence.id.clone(), occurrence.clone());
            }
        }
        Ok(())
    }

    async fn check_stalled_jobs(
        &self,
        _max_stalled_count: u32,
        _stalled_interval_ms: i64,
    ) -> Result<Option<StalledSweep>> {
        Ok(self
            .sweeps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Some(StalledSweep::default())))
    }

    async fn wait_for_job(&self, timeout_ms: i64) -> Result<()> {
        let nap = timeout_ms.clamp(1, 5) as u64;
        tokio::time::sleep(Duration::from_millis(nap)).await;
        Ok(())
    }

    async fn read_events(
        &self,
        _cursor: &str,
        _block_ms: i64,
        _count: usize,
    ) -> Result<Vec<QueueEvent>> {
        let batch = self.event_batches.lock().unwrap().pop_front();
        match batch {
            Some(batch) => Ok(batch),
            None => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Vec::new())
            }
        }
    }
}
