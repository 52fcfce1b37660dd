// Redis QueueStore implementation
//
// Maps the typed port surface onto the command scripts, converting the
// discriminated integer codes into typed errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use tracing::debug;

use conveyor_core::domain::{
    Job, JobId, JobState, KeepPolicy, QueueEvent, RateLimiterOptions, RepeatableDefinition,
    RepeatableListItem,
};
use conveyor_core::error::{AppError, Result};
use conveyor_core::port::store::{
    AddedJob, Fetched, FlowNodePlan, QueueStore, RetryDirective, StalledSweep, StoreCode,
    StoredRepeatable,
};
use conveyor_core::port::TimeProvider;

use crate::connection::{map_redis_error, StoreConnection};
use crate::keys::KeyLayout;
use crate::scripts::{add_job_source, Scripts};

/// Upper bound on entries kept in the events stream (approximate trim)
const EVENTS_MAX_LEN: u64 = 10_000;

/// Sequence span of the delayed composite score (low 12 bits)
const DELAYED_SEQ_SPAN: i64 = 0x1000;

/// Sentinel counter value written by a manual rate limit
const MANUAL_LIMIT_COUNT: u64 = u32::MAX as u64;

pub struct RedisQueueStore {
    conn: StoreConnection,
    keys: KeyLayout,
    scripts: Scripts,
    queue_key: String,
    time_provider: Arc<dyn TimeProvider>,
    // Blocking commands never share the multiplexed manager; each consumer
    // keeps its own lazily created connection
    marker_conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    events_conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl RedisQueueStore {
    pub fn new(
        conn: StoreConnection,
        prefix: impl Into<String>,
        queue_name: impl Into<String>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let keys = KeyLayout::new(prefix, queue_name);
        let queue_key = keys.queue_key();
        Self {
            conn,
            keys,
            scripts: Scripts::new(),
            queue_key,
            time_provider,
            marker_conn: tokio::sync::Mutex::new(None),
            events_conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    fn now(&self) -> i64 {
        self.time_provider.now_millis()
    }

    /// Append the add-script keys and args for one job to an invocation
    /// target (script invocation or EVAL pipeline).
    fn add_job_payload(
        keys: &KeyLayout,
        job: &Job,
        pending_children: &[String],
    ) -> Result<(Vec<String>, Vec<String>)> {
        let parent_json = match &job.parent {
            Some(parent) => serde_json::to_string(parent)?,
            None => String::new(),
        };
        let script_keys = vec![
            keys.id(),
            keys.wait(),
            keys.paused(),
            keys.meta(),
            keys.prioritized(),
            keys.pc(),
            keys.delayed(),
            keys.marker(),
            keys.events(),
            keys.waiting_children(),
        ];
        let args = vec![
            keys.base().to_string(),
            job.id.clone(),
            job.name.clone(),
            serde_json::to_string(&job.data)?,
            serde_json::to_string(&job.opts)?,
            job.timestamp.to_string(),
            job.delay.to_string(),
            job.priority.to_string(),
            EVENTS_MAX_LEN.to_string(),
            job.parent_key.clone().unwrap_or_default(),
            parent_json,
            job.repeat_job_key.clone().unwrap_or_default(),
            serde_json::to_string(pending_children)?,
            if job.opts.lifo { "1" } else { "0" }.to_string(),
        ];
        Ok((script_keys, args))
    }

    fn parse_added(value: Value) -> Result<AddedJob> {
        let Value::Array(parts) = value else {
            return Err(AppError::Store(format!(
                "unexpected add reply: {:?}",
                value
            )));
        };
        let id = parts
            .first()
            .and_then(as_string)
            .ok_or_else(|| AppError::Store("add reply missing job id".to_string()))?;
        let duplicated = parts.get(1).and_then(as_i64).unwrap_or(0) == 1;
        if duplicated {
            Ok(AddedJob::Duplicated(id))
        } else {
            Ok(AddedJob::Created(id))
        }
    }

    /// Shared handling for moveToCompleted/moveToFailed replies: a negative
    /// code, a bare 0, or the chained dispatch result.
    fn parse_finished(&self, value: Value, id: &str) -> Result<Option<Box<Job>>> {
        match value {
            Value::Int(0) => Ok(None),
            Value::Int(code) => Err(code_error(code, id, "active")),
            array @ Value::Array(_) => match parse_fetched(array)? {
                Fetched::Job(job) => Ok(Some(job)),
                _ => Ok(None),
            },
            other => Err(AppError::Store(format!(
                "unexpected finish reply: {:?}",
                other
            ))),
        }
    }

    async fn invoke_finished(
        &self,
        id: &JobId,
        token: &str,
        mode: &str,
        value: &str,
        retry: bool,
        retry_delay: i64,
        remove_policy: &KeepPolicy,
        fetch_next: bool,
        lock_duration_ms: i64,
        stacktrace_line: Option<&str>,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<Box<Job>>> {
        let target = if mode == "failed" {
            self.keys.failed()
        } else {
            self.keys.completed()
        };
        let (lmax, ldur, lgroup) = limiter_args(limiter);
        let mut conn = self.conn.manager();
        let reply: Value = self
            .scripts
            .move_to_finished
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.active())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .key(self.keys.limiter())
            .key(target)
            .key(self.keys.stalled())
            .arg(self.keys.base())
            .arg(id)
            .arg(token)
            .arg(self.now())
            .arg(mode)
            .arg(value)
            .arg(if retry { "1" } else { "0" })
            .arg(retry_delay)
            .arg(keep_count(remove_policy))
            .arg(keep_age(remove_policy))
            .arg(if fetch_next { "1" } else { "0" })
            .arg(lock_duration_ms)
            .arg(EVENTS_MAX_LEN)
            .arg(stacktrace_line.unwrap_or(""))
            .arg(&lmax)
            .arg(&ldur)
            .arg(&lgroup)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        self.parse_finished(reply, id)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    fn queue_key(&self) -> &str {
        &self.queue_key
    }

    async fn add_job(&self, job: &Job) -> Result<AddedJob> {
        let (keys, args) = Self::add_job_payload(&self.keys, job, &[])?;
        let mut invocation = self.scripts.add_job.prepare_invoke();
        for key in &keys {
            invocation.key(key.as_str());
        }
        for arg in &args {
            invocation.arg(arg.as_str());
        }
        let mut conn = self.conn.manager();
        let reply: Value = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Self::parse_added(reply)
    }

    async fn add_bulk(&self, jobs: &[Job]) -> Result<Vec<AddedJob>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let source = add_job_source();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in jobs {
            let (keys, args) = Self::add_job_payload(&self.keys, job, &[])?;
            let cmd = pipe.cmd("EVAL").arg(&source).arg(keys.len());
            for key in &keys {
                cmd.arg(key.as_str());
            }
            for arg in &args {
                cmd.arg(arg.as_str());
            }
        }
        let mut conn = self.conn.manager();
        let replies: Vec<Value> = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        replies.into_iter().map(Self::parse_added).collect()
    }

    async fn add_flow(&self, nodes: &[FlowNodePlan]) -> Result<Vec<AddedJob>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        let source = add_job_source();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for node in nodes {
            let keys = self.keys.sibling(&node.queue_name);
            let (script_keys, args) =
                Self::add_job_payload(&keys, &node.job, &node.pending_children)?;
            let cmd = pipe.cmd("EVAL").arg(&source).arg(script_keys.len());
            for key in &script_keys {
                cmd.arg(key.as_str());
            }
            for arg in &args {
                cmd.arg(arg.as_str());
            }
        }
        let mut conn = self.conn.manager();
        let replies: Vec<Value> = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        replies.into_iter().map(Self::parse_added).collect()
    }

    async fn move_to_active(
        &self,
        token: &str,
        lock_duration_ms: i64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Fetched> {
        let (lmax, ldur, lgroup) = limiter_args(limiter);
        let mut conn = self.conn.manager();
        let reply: Value = self
            .scripts
            .move_to_active
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.active())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .key(self.keys.limiter())
            .arg(self.keys.base())
            .arg(token)
            .arg(lock_duration_ms)
            .arg(self.now())
            .arg(&lmax)
            .arg(&ldur)
            .arg(&lgroup)
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        parse_fetched(reply)
    }

    async fn move_to_completed(
        &self,
        id: &JobId,
        returnvalue: &serde_json::Value,
        token: &str,
        remove_policy: &KeepPolicy,
        fetch_next: bool,
        lock_duration_ms: i64,
        limiter: Option<&RateLimiterOptions>,
    ) -> Result<Option<Box<Job>>> {
        let value = serde_json::to_string(returnvalue)?;
        self.invoke_finished(
            id,
            token,
            "completed",
            &value,
            false,
            0,
            remove_policy,
            fetch_next,
            lock_duration_ms,
            None,
            limiter,
        )
        .await
    }

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
    ) -> Result<Option<Box<Job>>> {
        self.invoke_finished(
            id,
            token,
            "failed",
            reason,
            directive.retry,
            directive.delay_ms,
            remove_policy,
            fetch_next,
            lock_duration_ms,
            stacktrace_line,
            limiter,
        )
        .await
    }

    async fn move_to_delayed(&self, id: &JobId, fire_at_millis: i64, token: &str) -> Result<()> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .move_to_delayed
            .key(self.keys.active())
            .key(self.keys.delayed())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(id)
            .arg(token)
            .arg(fire_at_millis)
            .arg(self.now())
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            0 => Ok(()),
            code => Err(code_error(code, id, "active")),
        }
    }

    async fn move_to_waiting_children(&self, id: &JobId, token: &str) -> Result<bool> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .move_to_waiting_children
            .key(self.keys.active())
            .key(self.keys.waiting_children())
            .arg(self.keys.base())
            .arg(id)
            .arg(token)
            .arg(self.now())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            1 => Ok(true),
            0 => Ok(false),
            code => Err(code_error(code, id, "active")),
        }
    }

    async fn extend_lock(&self, id: &JobId, token: &str, duration_ms: i64) -> Result<bool> {
        let mut conn = self.conn.manager();
        let renewed: i64 = self
            .scripts
            .extend_lock
            .key(self.keys.lock(id))
            .key(self.keys.stalled())
            .arg(token)
            .arg(duration_ms)
            .arg(id)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(renewed == 1)
    }

    async fn retry_job(&self, id: &JobId, from: JobState) -> Result<()> {
        let (source, prev) = match from {
            JobState::Completed => (self.keys.completed(), "completed"),
            JobState::Failed => (self.keys.failed(), "failed"),
            other => {
                return Err(AppError::Internal(format!(
                    "retry is only valid from completed or failed, not {}",
                    other
                )))
            }
        };
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .retry_job
            .key(source)
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.prioritized())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(id)
            .arg(prev)
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            0 => Ok(()),
            code => Err(code_error(code, id, prev)),
        }
    }

    async fn remove_job(&self, id: &JobId) -> Result<bool> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .remove_job
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.waiting_children())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(id)
            .arg(EVENTS_MAX_LEN)
            .arg(self.now())
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            1 => Ok(true),
            0 => Ok(false),
            code => Err(code_error(code, id, "inactive")),
        }
    }

    async fn promote(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .promote
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.prioritized())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(id)
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            0 => Ok(()),
            code => Err(code_error(code, id, "delayed")),
        }
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        let mut conn = self.conn.manager();
        let _: i64 = self
            .scripts
            .pause
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.events())
            .key(self.keys.marker())
            .arg(if paused { "pause" } else { "resume" })
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn drain(&self, include_delayed: bool) -> Result<()> {
        let mut conn = self.conn.manager();
        let _: i64 = self
            .scripts
            .drain
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.delayed())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(if include_delayed { "1" } else { "0" })
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn clean(&self, grace_ms: i64, limit: u64, state: JobState) -> Result<Vec<JobId>> {
        let cutoff = self.now() - grace_ms;
        let (source, cutoff) = match state {
            JobState::Completed => (self.keys.completed(), cutoff),
            JobState::Failed => (self.keys.failed(), cutoff),
            // Delayed scores are composite
            JobState::Delayed => (self.keys.delayed(), cutoff * DELAYED_SEQ_SPAN),
            other => {
                return Err(AppError::Internal(format!(
                    "clean is not supported for the {} state",
                    other
                )))
            }
        };
        let limit = if limit == 0 { u64::MAX >> 1 } else { limit };
        let mut conn = self.conn.manager();
        let ids: Vec<String> = self
            .scripts
            .clean_jobs
            .key(source)
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(cutoff)
            .arg(limit)
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        debug!(queue = %self.queue_key, count = %ids.len(), "Cleaned jobs");
        Ok(ids)
    }

    async fn obliterate(&self, force: bool) -> Result<()> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .obliterate
            .key(self.keys.meta())
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.prioritized())
            .key(self.keys.delayed())
            .key(self.keys.completed())
            .key(self.keys.failed())
            .key(self.keys.waiting_children())
            .key(self.keys.events())
            .key(self.keys.marker())
            .key(self.keys.id())
            .key(self.keys.pc())
            .key(self.keys.repeat())
            .key(self.keys.stalled_check())
            .key(self.keys.stalled())
            .key(self.keys.limiter())
            .arg(self.keys.base())
            .arg(if force { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            0 => Ok(()),
            _ => Err(AppError::Internal(
                "Cannot obliterate a queue with active jobs".to_string(),
            )),
        }
    }

    async fn rate_limit(&self, duration_ms: i64) -> Result<()> {
        let mut conn = self.conn.manager();
        redis::cmd("SET")
            .arg(self.keys.limiter())
            .arg(MANUAL_LIMIT_COUNT)
            .arg("PX")
            .arg(duration_ms.max(1))
            .query_async::<()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.conn.manager();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(id))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_store_map(id.clone(), &map)?))
    }

    async fn get_state(&self, id: &JobId) -> Result<Option<JobState>> {
        let mut conn = self.conn.manager();
        let (active, completed, failed, delayed, prioritized, waiting_children, wait, paused): (
            bool,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<i64>,
            Option<i64>,
        ) = redis::pipe()
            .cmd("SISMEMBER")
            .arg(self.keys.active())
            .arg(id)
            .cmd("ZSCORE")
            .arg(self.keys.completed())
            .arg(id)
            .cmd("ZSCORE")
            .arg(self.keys.failed())
            .arg(id)
            .cmd("ZSCORE")
            .arg(self.keys.delayed())
            .arg(id)
            .cmd("ZSCORE")
            .arg(self.keys.prioritized())
            .arg(id)
            .cmd("ZSCORE")
            .arg(self.keys.waiting_children())
            .arg(id)
            .cmd("LPOS")
            .arg(self.keys.wait())
            .arg(id)
            .cmd("LPOS")
            .arg(self.keys.paused())
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let state = if active {
            Some(JobState::Active)
        } else if completed.is_some() {
            Some(JobState::Completed)
        } else if failed.is_some() {
            Some(JobState::Failed)
        } else if delayed.is_some() {
            Some(JobState::Delayed)
        } else if prioritized.is_some() {
            Some(JobState::Prioritized)
        } else if waiting_children.is_some() {
            Some(JobState::WaitingChildren)
        } else if wait.is_some() {
            Some(JobState::Waiting)
        } else if paused.is_some() {
            Some(JobState::Paused)
        } else {
            None
        };
        Ok(state)
    }

    async fn get_counts(&self, states: &[JobState]) -> Result<HashMap<JobState, u64>> {
        let mut conn = self.conn.manager();
        let mut pipe = redis::pipe();
        for state in states {
            match state {
                JobState::Waiting => pipe.cmd("LLEN").arg(self.keys.wait()),
                JobState::Paused => pipe.cmd("LLEN").arg(self.keys.paused()),
                JobState::Active => pipe.cmd("SCARD").arg(self.keys.active()),
                JobState::Prioritized => pipe.cmd("ZCARD").arg(self.keys.prioritized()),
                JobState::Delayed => pipe.cmd("ZCARD").arg(self.keys.delayed()),
                JobState::Completed => pipe.cmd("ZCARD").arg(self.keys.completed()),
                JobState::Failed => pipe.cmd("ZCARD").arg(self.keys.failed()),
                JobState::WaitingChildren => pipe.cmd("ZCARD").arg(self.keys.waiting_children()),
            };
        }
        let counts: Vec<u64> = pipe.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(states.iter().copied().zip(counts).collect())
    }

    async fn list_jobs(
        &self,
        state: JobState,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<Job>> {
        let mut conn = self.conn.manager();
        let stop = if limit < 0 { -1 } else { offset + limit - 1 };
        let ids: Vec<String> = match state {
            JobState::Waiting | JobState::Paused => {
                let key = if state == JobState::Waiting {
                    self.keys.wait()
                } else {
                    self.keys.paused()
                };
                // Lists dispatch from the tail, so ascending slices read
                // from there and flip back into FIFO order
                if asc {
                    let (start, end) = if limit < 0 {
                        (0, -1)
                    } else {
                        (-(offset + limit), -(offset + 1))
                    };
                    let raw: Vec<String> = redis::cmd("LRANGE")
                        .arg(&key)
                        .arg(start)
                        .arg(end)
                        .query_async(&mut conn)
                        .await
                        .map_err(map_redis_error)?;
                    raw.into_iter().rev().collect()
                } else {
                    redis::cmd("LRANGE")
                        .arg(&key)
                        .arg(offset)
                        .arg(stop)
                        .query_async(&mut conn)
                        .await
                        .map_err(map_redis_error)?
                }
            }
            JobState::Active => {
                let members: Vec<String> = redis::cmd("SMEMBERS")
                    .arg(self.keys.active())
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?;
                let skip = offset.max(0) as usize;
                let take = if limit < 0 { usize::MAX } else { limit as usize };
                members.into_iter().skip(skip).take(take).collect()
            }
            other => {
                let key = match other {
                    JobState::Prioritized => self.keys.prioritized(),
                    JobState::Delayed => self.keys.delayed(),
                    JobState::Completed => self.keys.completed(),
                    JobState::Failed => self.keys.failed(),
                    _ => self.keys.waiting_children(),
                };
                let command = if asc { "ZRANGE" } else { "ZREVRANGE" };
                redis::cmd(command)
                    .arg(&key)
                    .arg(offset)
                    .arg(stop)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_redis_error)?
            }
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get_job(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn update_progress(&self, id: &JobId, progress: &serde_json::Value) -> Result<()> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .update_progress
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(id)
            .arg(serde_json::to_string(progress)?)
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            0 => Ok(()),
            code => Err(code_error(code, id, "known")),
        }
    }

    async fn append_log(&self, id: &JobId, row: &str, keep_logs: Option<usize>) -> Result<u64> {
        let mut conn = self.conn.manager();
        let count: i64 = self
            .scripts
            .add_log
            .key(self.keys.logs(id))
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(id)
            .arg(row)
            .arg(keep_logs.map(|n| n.to_string()).unwrap_or_default())
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if count < 0 {
            return Err(code_error(count, id, "known"));
        }
        Ok(count as u64)
    }

    async fn change_priority(&self, id: &JobId, priority: u32, lifo: bool) -> Result<()> {
        let mut conn = self.conn.manager();
        let code: i64 = self
            .scripts
            .change_priority
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.prioritized())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .arg(self.keys.base())
            .arg(id)
            .arg(priority)
            .arg(if lifo { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match code {
            0 => Ok(()),
            code => Err(code_error(code, id, "known")),
        }
    }

    async fn upsert_repeatable(
        &self,
        def: &RepeatableDefinition,
        occurrence: &Job,
        legacy_key: Option<&str>,
    ) -> Result<()> {
        let def_fields: serde_json::Map<String, serde_json::Value> = def
            .to_store_pairs()?
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v)))
            .collect();
        let mut conn = self.conn.manager();
        let _: String = self
            .scripts
            .upsert_repeatable
            .key(self.keys.repeat())
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .key(self.keys.prioritized())
            .arg(self.keys.base())
            .arg(&def.key)
            .arg(legacy_key.unwrap_or(""))
            .arg(serde_json::Value::Object(def_fields).to_string())
            .arg(&occurrence.id)
            .arg(&occurrence.name)
            .arg(serde_json::to_string(&occurrence.data)?)
            .arg(serde_json::to_string(&occurrence.opts)?)
            .arg(occurrence.timestamp)
            .arg(occurrence.delay)
            .arg(occurrence.delay_until())
            .arg(EVENTS_MAX_LEN)
            .arg(occurrence.priority)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn remove_repeatable(&self, key: &str, legacy_key: Option<&str>) -> Result<bool> {
        let mut conn = self.conn.manager();
        let removed: i64 = self
            .scripts
            .remove_repeatable
            .key(self.keys.repeat())
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.prioritized())
            .arg(self.keys.base())
            .arg(key)
            .arg(legacy_key.unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed == 1)
    }

    async fn get_repeatable(&self, key: &str) -> Result<Option<StoredRepeatable>> {
        let mut conn = self.conn.manager();
        let (map, score): (HashMap<String, String>, Option<f64>) = redis::pipe()
            .cmd("HGETALL")
            .arg(self.keys.repeat_def(key))
            .cmd("ZSCORE")
            .arg(self.keys.repeat())
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        if map.is_empty() {
            return Ok(None);
        }
        let def = RepeatableDefinition::from_store_map(key, &map)?;
        Ok(Some(StoredRepeatable {
            def,
            outstanding: score.map(|s| s as i64),
        }))
    }

    async fn list_repeatable(
        &self,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<RepeatableListItem>> {
        let mut conn = self.conn.manager();
        let stop = if limit < 0 { -1 } else { offset + limit - 1 };
        let command = if asc { "ZRANGE" } else { "ZREVRANGE" };
        let members: Vec<(String, f64)> = redis::cmd(command)
            .arg(self.keys.repeat())
            .arg(offset)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut items = Vec::with_capacity(members.len());
        for (member, score) in members {
            let map: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(self.keys.repeat_def(&member))
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            let item = if map.is_empty() {
                // Legacy zset member: name:jobId:endDate:tz:suffix
                legacy_list_item(&member, score as i64)
            } else {
                let def = RepeatableDefinition::from_store_map(member.clone(), &map)?;
                RepeatableListItem {
                    key: member,
                    name: def.name,
                    end_date: def.opts.end_date,
                    tz: def.opts.tz,
                    pattern: def.opts.pattern,
                    every: def.opts.every,
                    next: score as i64,
                }
            };
            items.push(item);
        }
        Ok(items)
    }

    async fn advance_repeatable(
        &self,
        key: &str,
        occurrence: Option<&Job>,
        next: Option<i64>,
    ) -> Result<()> {
        let (occ_id, occ_name, occ_data, occ_opts, occ_fire, occ_priority) = match occurrence {
            Some(job) => (
                job.id.clone(),
                job.name.clone(),
                serde_json::to_string(&job.data)?,
                serde_json::to_string(&job.opts)?,
                job.delay_until(),
                job.priority,
            ),
            None => (
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                0,
                0,
            ),
        };
        let mut conn = self.conn.manager();
        let _: i64 = self
            .scripts
            .advance_repeatable
            .key(self.keys.repeat())
            .key(self.keys.delayed())
            .key(self.keys.pc())
            .key(self.keys.marker())
            .key(self.keys.events())
            .arg(self.keys.base())
            .arg(key)
            .arg(occ_id)
            .arg(occ_name)
            .arg(occ_data)
            .arg(occ_opts)
            .arg(self.now())
            .arg(occ_fire)
            .arg(next.map(|n| n.to_string()).unwrap_or_default())
            .arg(EVENTS_MAX_LEN)
            .arg(occ_priority)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn check_stalled_jobs(
        &self,
        max_stalled_count: u32,
        stalled_interval_ms: i64,
    ) -> Result<Option<StalledSweep>> {
        let mut conn = self.conn.manager();
        let reply: Value = self
            .scripts
            .move_stalled_jobs
            .key(self.keys.stalled_check())
            .key(self.keys.active())
            .key(self.keys.wait())
            .key(self.keys.paused())
            .key(self.keys.meta())
            .key(self.keys.marker())
            .key(self.keys.events())
            .key(self.keys.failed())
            .key(self.keys.stalled())
            .arg(self.keys.base())
            .arg(max_stalled_count)
            .arg(stalled_interval_ms.max(1))
            .arg(self.now())
            .arg(EVENTS_MAX_LEN)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        match reply {
            Value::Nil => Ok(None),
            Value::Array(parts) => {
                let stalled = string_array(parts.first());
                let failed = string_array(parts.get(1));
                Ok(Some(StalledSweep { stalled, failed }))
            }
            other => Err(AppError::Store(format!(
                "unexpected stalled sweep reply: {:?}",
                other
            ))),
        }
    }

    async fn wait_for_job(&self, timeout_ms: i64) -> Result<()> {
        let mut guard = self.marker_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.conn.blocking().await?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| AppError::Internal("missing blocking connection".to_string()))?;
        let timeout_secs = (timeout_ms.max(MIN_BLOCK_MS) as f64) / 1000.0;
        let result: redis::RedisResult<Value> = redis::cmd("BZPOPMIN")
            .arg(self.keys.marker())
            .arg(timeout_secs)
            .query_async(conn)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                // Drop the connection so the next wait reconnects
                *guard = None;
                Err(map_redis_error(e))
            }
        }
    }

    async fn read_events(
        &self,
        cursor: &str,
        block_ms: i64,
        count: usize,
    ) -> Result<Vec<QueueEvent>> {
        let mut guard = self.events_conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.conn.blocking().await?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| AppError::Internal("missing blocking connection".to_string()))?;
        let result: redis::RedisResult<Value> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block_ms.max(MIN_BLOCK_MS))
            .arg("STREAMS")
            .arg(self.keys.events())
            .arg(cursor)
            .query_async(conn)
            .await;
        match result {
            Ok(reply) => Ok(parse_stream_reply(reply)),
            Err(e) => {
                *guard = None;
                Err(map_redis_error(e))
            }
        }
    }
}

const MIN_BLOCK_MS: i64 = 10;

/// Decode the dispatch reply shape shared by moveToActive and the chained
/// fetch inside moveToFinished.
fn parse_fetched(value: Value) -> Result<Fetched> {
    let Value::Array(parts) = value else {
        return Ok(Fetched::Empty);
    };
    let Some(tag) = parts.first().and_then(as_string) else {
        return Ok(Fetched::Empty);
    };
    match tag.as_str() {
        "job" => {
            let id = parts
                .get(1)
                .and_then(as_string)
                .ok_or_else(|| AppError::Store("dispatch reply missing id".to_string()))?;
            let map = flat_map(&parts[2..]);
            let job = Job::from_store_map(id, &map)?;
            Ok(Fetched::Job(Box::new(job)))
        }
        "limit" => Ok(Fetched::RateLimited {
            limit_until: parts.get(1).and_then(as_i64).unwrap_or(0),
        }),
        "delay" => Ok(Fetched::DelayedUntil {
            delay_until: parts.get(1).and_then(as_i64).unwrap_or(0),
        }),
        other => Err(AppError::Store(format!("unknown dispatch tag: {}", other))),
    }
}

fn limiter_args(limiter: Option<&RateLimiterOptions>) -> (String, String, String) {
    match limiter {
        Some(limiter) => (
            limiter.max.to_string(),
            limiter.duration.to_string(),
            if limiter.group_key.is_some() { "1" } else { "0" }.to_string(),
        ),
        None => (String::new(), String::new(), "0".to_string()),
    }
}

fn keep_count(policy: &KeepPolicy) -> i64 {
    match policy {
        KeepPolicy::Bool(false) => -1,
        KeepPolicy::Bool(true) => 0,
        KeepPolicy::Count(n) => *n as i64,
        KeepPolicy::Limits { count, .. } => count.map(|n| n as i64).unwrap_or(-1),
    }
}

fn keep_age(policy: &KeepPolicy) -> i64 {
    match policy {
        KeepPolicy::Limits { age, .. } => age.map(|a| a as i64).unwrap_or(0),
        _ => 0,
    }
}

fn code_error(code: i64, id: &str, expected: &str) -> AppError {
    match StoreCode::from_i64(code) {
        Some(StoreCode::Ok) | None => AppError::UnexpectedCode {
            id: id.to_string(),
            code,
        },
        Some(code) => code.into_error(id, expected),
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}

fn flat_map(values: &[Value]) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(values.len() / 2);
    for pair in values.chunks_exact(2) {
        if let (Some(k), Some(v)) = (as_string(&pair[0]), as_string(&pair[1])) {
            map.insert(k, v);
        }
    }
    map
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(as_string).collect(),
        _ => Vec::new(),
    }
}

/// Parse a raw XREAD reply into events. A nil reply means the block timed
/// out with nothing new.
fn parse_stream_reply(reply: Value) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    let Value::Array(streams) = reply else {
        return events;
    };
    for stream in streams {
        let Value::Array(stream_parts) = stream else {
            continue;
        };
        let Some(Value::Array(entries)) = stream_parts.get(1) else {
            continue;
        };
        for entry in entries {
            let Value::Array(entry_parts) = entry else {
                continue;
            };
            let Some(id) = entry_parts.first().and_then(as_string) else {
                continue;
            };
            let fields = match entry_parts.get(1) {
                Some(Value::Array(raw)) => flat_map(raw),
                _ => HashMap::new(),
            };
            if let Some(event) = QueueEvent::from_stream_entry(id, fields) {
                events.push(event);
            }
        }
    }
    events
}

/// Rebuild a listing row out of a legacy zset member,
/// `name:jobId:endDate:tz:suffix`.
fn legacy_list_item(member: &str, next: i64) -> RepeatableListItem {
    let parts: Vec<&str> = member.splitn(5, ':').collect();
    let get = |i: usize| -> Option<String> {
        parts
            .get(i)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };
    let suffix = get(4);
    let every = suffix.as_deref().and_then(|s| s.parse::<i64>().ok());
    RepeatableListItem {
        key: member.to_string(),
        name: get(0).unwrap_or_default(),
        end_date: get(2).and_then(|s| s.parse().ok()),
        tz: get(3),
        pattern: if every.is_none() { suffix } else { None },
        every,
        next,
    }
}
