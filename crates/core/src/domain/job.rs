// Job record - the unit of work moved between state sets by the store scripts

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::options::JobOptions;

/// Job ID (server-assigned counter value or caller-supplied string)
pub type JobId = String;

/// Reference from a child job to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub id: JobId,
    /// Qualified queue key of the parent, `<prefix>:<queueName>`
    pub queue_key: String,
}

impl ParentRef {
    /// Fully qualified parent job key, `<prefix>:<queueName>:<id>`
    pub fn job_key(&self) -> String {
        format!("{}:{}", self.queue_key, self.id)
    }
}

/// The state sets a job id can live in. A job is in exactly one at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Prioritized,
    Active,
    Delayed,
    Completed,
    Failed,
    WaitingChildren,
    Paused,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Waiting => "waiting",
            JobState::Prioritized => "prioritized",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::WaitingChildren => "waiting-children",
            JobState::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "prioritized" => Ok(JobState::Prioritized),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "waiting-children" => Ok(JobState::WaitingChildren),
            "paused" => Ok(JobState::Paused),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// Job entity. Persisted as a flat hash under `<prefix>:<queue>:<id>`;
/// mutated only via the atomic store scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    /// Opaque JSON payload
    pub data: serde_json::Value,
    pub opts: JobOptions,
    /// Enqueue wall time (epoch ms)
    pub timestamp: i64,
    pub delay: i64,
    pub priority: u32,
    /// Bumped on every dispatch into `active`
    pub attempts_started: u32,
    /// Counted on each non-retry failure
    pub attempts_made: u32,
    /// Times this job was recovered from a missing lock
    pub stalled_counter: u32,
    pub failed_reason: Option<String>,
    /// Bounded by `opts.stack_trace_limit`
    pub stacktrace: Vec<String>,
    pub returnvalue: Option<serde_json::Value>,
    pub progress: serde_json::Value,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    pub parent: Option<ParentRef>,
    /// Qualified key of the parent job, when part of a flow
    pub parent_key: Option<String>,
    /// Set when produced by a job scheduler
    pub repeat_job_key: Option<String>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
        now_millis: i64,
    ) -> Self {
        let timestamp = opts.timestamp.unwrap_or(now_millis);
        let delay = opts.delay;
        let priority = opts.priority;
        Self {
            id: opts.job_id.clone().unwrap_or_default(),
            name: name.into(),
            data,
            opts,
            timestamp,
            delay,
            priority,
            attempts_started: 0,
            attempts_made: 0,
            stalled_counter: 0,
            failed_reason: None,
            stacktrace: Vec::new(),
            returnvalue: None,
            progress: serde_json::Value::from(0),
            processed_on: None,
            finished_on: None,
            parent: None,
            parent_key: None,
            repeat_job_key: None,
        }
    }

    /// Fully qualified job key, `<prefix>:<queueName>:<id>`
    pub fn qualified_key(&self, queue_key: &str) -> String {
        format!("{}:{}", queue_key, self.id)
    }

    /// Whether retries remain given the configured attempt cap.
    /// `attempts` of 0 or 1 means a single try.
    pub fn attempts_exhausted(&self) -> bool {
        let max = self.opts.attempts.max(1);
        self.attempts_made + 1 >= max
    }

    pub fn is_completed(&self) -> bool {
        self.finished_on.is_some() && self.failed_reason.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.finished_on.is_some() && self.failed_reason.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.processed_on.is_some() && self.finished_on.is_none()
    }

    pub fn is_delayed(&self) -> bool {
        self.delay > 0 && self.finished_on.is_none() && self.processed_on.is_none()
    }

    /// Scheduled fire time for delayed jobs
    pub fn delay_until(&self) -> i64 {
        self.timestamp + self.delay
    }

    /// Flatten into hash field pairs for the store.
    /// Structured values are JSON, integers are decimal strings.
    pub fn to_store_pairs(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut pairs = vec![
            ("name", self.name.clone()),
            ("data", serde_json::to_string(&self.data)?),
            ("opts", serde_json::to_string(&self.opts)?),
            ("timestamp", self.timestamp.to_string()),
            ("delay", self.delay.to_string()),
            ("priority", self.priority.to_string()),
            ("attemptsStarted", self.attempts_started.to_string()),
            ("attemptsMade", self.attempts_made.to_string()),
            ("stalledCounter", self.stalled_counter.to_string()),
            ("progress", serde_json::to_string(&self.progress)?),
        ];
        if let Some(reason) = &self.failed_reason {
            pairs.push(("failedReason", reason.clone()));
        }
        if !self.stacktrace.is_empty() {
            pairs.push(("stacktrace", serde_json::to_string(&self.stacktrace)?));
        }
        if let Some(value) = &self.returnvalue {
            pairs.push(("returnvalue", serde_json::to_string(value)?));
        }
        if let Some(processed_on) = self.processed_on {
            pairs.push(("processedOn", processed_on.to_string()));
        }
        if let Some(finished_on) = self.finished_on {
            pairs.push(("finishedOn", finished_on.to_string()));
        }
        if let Some(parent) = &self.parent {
            pairs.push(("parent", serde_json::to_string(parent)?));
        }
        if let Some(parent_key) = &self.parent_key {
            pairs.push(("parentKey", parent_key.clone()));
        }
        if let Some(repeat_job_key) = &self.repeat_job_key {
            pairs.push(("repeatJobKey", repeat_job_key.clone()));
        }
        Ok(pairs)
    }

    /// Rebuild a job from the flat hash representation.
    pub fn from_store_map(
        id: impl Into<JobId>,
        map: &HashMap<String, String>,
    ) -> Result<Self, serde_json::Error> {
        let int = |field: &str| -> i64 {
            map.get(field)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let opt_int = |field: &str| -> Option<i64> {
            map.get(field).and_then(|v| v.parse::<i64>().ok())
        };

        let data = match map.get("data") {
            Some(raw) => serde_json::from_str(raw)?,
            None => serde_json::Value::Null,
        };
        let opts: JobOptions = match map.get("opts") {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let progress = match map.get("progress") {
            Some(raw) => serde_json::from_str(raw).unwrap_or(serde_json::Value::from(0)),
            None => serde_json::Value::from(0),
        };
        let stacktrace = match map.get("stacktrace") {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        let returnvalue = match map.get("returnvalue") {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        let parent: Option<ParentRef> = match map.get("parent") {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };

        Ok(Self {
            id: id.into(),
            name: map.get("name").cloned().unwrap_or_default(),
            data,
            timestamp: int("timestamp"),
            delay: int("delay"),
            priority: int("priority") as u32,
            attempts_started: int("attemptsStarted") as u32,
            attempts_made: int("attemptsMade") as u32,
            stalled_counter: int("stalledCounter") as u32,
            failed_reason: map.get("failedReason").cloned(),
            stacktrace,
            returnvalue,
            progress,
            processed_on: opt_int("processedOn"),
            finished_on: opt_int("finishedOn"),
            parent,
            parent_key: map.get("parentKey").cloned(),
            repeat_job_key: map.get("repeatJobKey").cloned(),
            opts,
        })
    }
}
