// Option records for jobs, queues and workers.
// Dynamic option bags become tagged records; unknown fields are rejected at parse time.

use serde::{Deserialize, Serialize};

use super::error::{DomainError, Result, MAX_PRIORITY};

/// Backoff strategy selector for failed jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BackoffOptions {
    /// Bare number: fixed backoff with the given delay in ms
    Delay(i64),
    /// Tagged strategy record. `type` is `"fixed"`, `"exponential"`, or the
    /// name of a strategy registered in the queue's backoff strategy table.
    Strategy {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<serde_json::Value>,
    },
}

/// Retention policy for terminal jobs (`removeOnComplete` / `removeOnFail`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeepPolicy {
    /// `true` removes the job immediately, `false` keeps it forever
    Bool(bool),
    /// Keep the newest N jobs
    Count(u64),
    /// Cap by both count and age (seconds)
    Limits {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        age: Option<u64>,
    },
}

impl Default for KeepPolicy {
    fn default() -> Self {
        KeepPolicy::Bool(false)
    }
}

impl KeepPolicy {
    /// Whether the policy keeps every terminal job
    pub fn keeps_all(&self) -> bool {
        matches!(self, KeepPolicy::Bool(false))
    }
}

/// Options for a repeatable job definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RepeatOptions {
    /// Cron pattern (mutually exclusive with `every`)
    pub pattern: Option<String>,
    /// Fixed interval in ms (mutually exclusive with `pattern`)
    pub every: Option<i64>,
    /// IANA timezone name used to evaluate `pattern`
    pub tz: Option<String>,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    /// Maximum number of occurrences to produce
    pub limit: Option<u64>,
    /// Fire the first occurrence at upsert time, then resume the pattern
    pub immediately: bool,
    pub utc: bool,
    /// Custom id used for materialized occurrence jobs
    pub job_id: Option<String>,
    /// Caller-supplied definition key (legacy format, used verbatim)
    pub key: Option<String>,
}

impl RepeatOptions {
    /// Contract validation; no store mutation happens when this fails.
    pub fn validate(&self, now_millis: i64) -> Result<()> {
        if self.pattern.is_some() && self.every.is_some() {
            return Err(DomainError::ConflictingRepeatOptions);
        }
        if let Some(end_date) = self.end_date {
            if end_date <= now_millis {
                return Err(DomainError::EndDateInPast);
            }
        }
        Ok(())
    }

    /// The fingerprint suffix: the cron pattern or the stringified interval.
    pub fn suffix(&self) -> String {
        match (&self.pattern, self.every) {
            (Some(pattern), _) => pattern.clone(),
            (None, Some(every)) => every.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Per-job options recognized by `add`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct JobOptions {
    /// Delay in ms before the job becomes ready
    pub delay: i64,
    /// Override the enqueue wall time
    pub timestamp: Option<i64>,
    /// Total tries before the job lands in `failed` (0 and 1 mean no retries)
    pub attempts: u32,
    pub backoff: Option<BackoffOptions>,
    pub remove_on_complete: KeepPolicy,
    pub remove_on_fail: KeepPolicy,
    /// Caller-supplied job id; adds with an existing id are idempotent
    pub job_id: Option<String>,
    /// 0 = unprioritized FIFO; 1..2^21-1 dispatch before the waiting list
    pub priority: u32,
    /// Insert at the head of the waiting list instead of the tail
    pub lifo: bool,
    /// On terminal child failure, fail the parent as well
    pub fail_parent_on_failure: bool,
    /// On child failure, let the parent progress as if the child succeeded
    pub continue_parent_on_failure: bool,
    /// Like `continueParentOnFailure`, but record the failure on the parent
    pub ignore_dependency_on_failure: bool,
    /// Like `continueParentOnFailure`, but drop the child from the pending set
    pub remove_dependency_on_failure: bool,
    pub repeat: Option<RepeatOptions>,
    /// Bound on retained stacktrace entries
    pub stack_trace_limit: Option<usize>,
    /// Bound on retained log rows
    pub keep_logs: Option<usize>,
    /// Rate-limiter partition key for per-group limiting
    pub group_key: Option<String>,
}

impl JobOptions {
    pub fn validate(&self, now_millis: i64) -> Result<()> {
        if self.priority > MAX_PRIORITY {
            return Err(DomainError::PriorityOutOfRange);
        }
        if let Some(repeat) = &self.repeat {
            repeat.validate(now_millis)?;
        }
        Ok(())
    }
}

/// Rate limiter window shared by all workers of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimiterOptions {
    /// Max dispatches per window
    pub max: u64,
    /// Window length in ms
    pub duration: i64,
    /// Partition counters by the job's `groupKey` option
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
}

/// Worker runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct WorkerOptions {
    /// Max in-flight processings; mutable at runtime via `Worker::set_concurrency`
    pub concurrency: usize,
    /// TTL of the per-job lock in ms
    pub lock_duration: i64,
    /// Lock renewal interval; defaults to `lock_duration / 2`
    pub lock_renew_time: Option<i64>,
    /// Interval between stalled-job sweeps in ms
    pub stalled_interval: i64,
    /// Times a job may stall before it is failed
    pub max_stalled_count: u32,
    pub limiter: Option<RateLimiterOptions>,
    /// Start processing on construction
    pub autorun: bool,
    pub skip_stalled_check: bool,
    pub skip_lock_renewal: bool,
    /// Upper bound on a blocking fetch wait in ms
    pub drain_delay: i64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration: 30_000,
            lock_renew_time: None,
            stalled_interval: 30_000,
            max_stalled_count: 1,
            limiter: None,
            autorun: true,
            skip_stalled_check: false,
            skip_lock_renewal: false,
            drain_delay: 5_000,
        }
    }
}

impl WorkerOptions {
    pub fn lock_renew_time(&self) -> i64 {
        self.lock_renew_time.unwrap_or(self.lock_duration / 2)
    }
}

/// Hash algorithm for repeatable-job fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatKeyHashAlgorithm {
    #[default]
    Md5,
    Sha256,
}

/// Queue-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueueSettings {
    pub repeat_key_hash_algorithm: RepeatKeyHashAlgorithm,
}

/// Queue construction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct QueueOptions {
    /// Key prefix in front of every queue key
    pub prefix: String,
    pub default_job_options: JobOptions,
    pub settings: QueueSettings,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            prefix: "bull".to_string(),
            default_job_options: JobOptions::default(),
            settings: QueueSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_repeat_options_are_rejected() {
        let repeat = RepeatOptions {
            pattern: Some("*/2 * * * * *".to_string()),
            every: Some(1000),
            ..Default::default()
        };
        let err = repeat.validate(0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Both .pattern and .every options are defined for this repeatable job"
        );
    }

    #[test]
    fn end_date_must_be_in_the_future() {
        let repeat = RepeatOptions {
            every: Some(1000),
            end_date: Some(5_000),
            ..Default::default()
        };
        assert!(repeat.validate(4_999).is_ok());
        let err = repeat.validate(5_000).unwrap_err();
        assert_eq!(
            err.to_string(),
            "End date must be greater than current timestamp"
        );
    }

    #[test]
    fn priority_range_is_enforced() {
        let opts = JobOptions {
            priority: MAX_PRIORITY,
            ..Default::default()
        };
        assert!(opts.validate(0).is_ok());

        let opts = JobOptions {
            priority: MAX_PRIORITY + 1,
            ..Default::default()
        };
        assert!(opts.validate(0).is_err());
    }

    #[test]
    fn unknown_option_fields_are_rejected() {
        let parsed: std::result::Result<JobOptions, _> =
            serde_json::from_str(r#"{"delay": 100, "bogus": true}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn backoff_accepts_bare_number_and_tagged_record() {
        let bare: BackoffOptions = serde_json::from_str("15000").unwrap();
        assert_eq!(bare, BackoffOptions::Delay(15000));

        let tagged: BackoffOptions =
            serde_json::from_str(r#"{"type": "exponential", "delay": 10000}"#).unwrap();
        assert_eq!(
            tagged,
            BackoffOptions::Strategy {
                kind: "exponential".to_string(),
                delay: Some(10000),
                options: None,
            }
        );
    }

    #[test]
    fn keep_policy_accepts_all_three_shapes() {
        let flag: KeepPolicy = serde_json::from_str("true").unwrap();
        assert_eq!(flag, KeepPolicy::Bool(true));

        let count: KeepPolicy = serde_json::from_str("100").unwrap();
        assert_eq!(count, KeepPolicy::Count(100));

        let caps: KeepPolicy = serde_json::from_str(r#"{"count": 10, "age": 3600}"#).unwrap();
        assert_eq!(
            caps,
            KeepPolicy::Limits {
                count: Some(10),
                age: Some(3600),
            }
        );
    }
}
