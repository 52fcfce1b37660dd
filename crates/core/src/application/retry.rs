// Retry logic - decides between re-queue with backoff and terminal failure

use crate::domain::backoff::BackoffStrategies;
use crate::domain::Job;
use crate::error::Result;
use tracing::{info, warn};

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the job (with backoff delay in ms)
    Retry(i64),
    /// Do not retry, job has failed permanently
    Failed,
}

/// Retry policy
///
/// Determines if a failed job should be retried based on:
/// - The attempt counter after the current failure was counted
/// - The configured attempt cap (`opts.attempts`; 0 and 1 mean a single try)
/// - The backoff strategy (fixed, exponential, or a registered custom one)
pub struct RetryPolicy {
    strategies: BackoffStrategies,
}

impl RetryPolicy {
    pub fn new(strategies: BackoffStrategies) -> Self {
        Self { strategies }
    }

    /// Determine if a job should be retried.
    ///
    /// `attempts_made` must already include the current failure, so the first
    /// failure calls with `attempts_made == 1`. Jobs marked `discard` bypass
    /// retries even when attempts remain.
    pub fn decide(
        &self,
        job: &Job,
        attempts_made: u32,
        failure: Option<&str>,
        discard: bool,
    ) -> Result<RetryDecision> {
        if discard {
            info!(job_id = %job.id, "Job discarded, skipping retries");
            return Ok(RetryDecision::Failed);
        }

        let max_attempts = job.opts.attempts.max(1);
        if attempts_made >= max_attempts {
            warn!(
                job_id = %job.id,
                attempts_made = %attempts_made,
                max_attempts = %max_attempts,
                "Max retry attempts reached"
            );
            return Ok(RetryDecision::Failed);
        }

        let delay_ms =
            self.strategies
                .compute(job.opts.backoff.as_ref(), attempts_made, failure, job)?;

        info!(
            job_id = %job.id,
            attempt = %attempts_made,
            max_attempts = %max_attempts,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );

        Ok(RetryDecision::Retry(delay_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BackoffOptions, JobOptions};

    fn job_with(attempts: u32, backoff: Option<BackoffOptions>) -> Job {
        let opts = JobOptions {
            attempts,
            backoff,
            ..Default::default()
        };
        Job::new("t", serde_json::Value::Null, opts, 0)
    }

    #[test]
    fn retries_until_attempts_exhausted() {
        let policy = RetryPolicy::new(BackoffStrategies::new());
        let job = job_with(3, Some(BackoffOptions::Delay(100)));

        assert_eq!(
            policy.decide(&job, 1, None, false).unwrap(),
            RetryDecision::Retry(100)
        );
        assert_eq!(
            policy.decide(&job, 2, None, false).unwrap(),
            RetryDecision::Retry(100)
        );
        assert_eq!(
            policy.decide(&job, 3, None, false).unwrap(),
            RetryDecision::Failed
        );
    }

    #[test]
    fn exponential_schedule_doubles() {
        let policy = RetryPolicy::new(BackoffStrategies::new());
        let job = job_with(
            10,
            Some(BackoffOptions::Strategy {
                kind: "exponential".to_string(),
                delay: Some(10_000),
                options: None,
            }),
        );

        let mut delays = Vec::new();
        for attempt in 1..=3 {
            match policy.decide(&job, attempt, None, false).unwrap() {
                RetryDecision::Retry(delay) => delays.push(delay),
                RetryDecision::Failed => panic!("should retry"),
            }
        }
        assert_eq!(delays, vec![10_000, 20_000, 40_000]);
    }

    #[test]
    fn zero_attempts_means_single_try() {
        let policy = RetryPolicy::new(BackoffStrategies::new());
        let job = job_with(0, None);
        assert_eq!(
            policy.decide(&job, 1, None, false).unwrap(),
            RetryDecision::Failed
        );
    }

    #[test]
    fn discard_bypasses_remaining_attempts() {
        let policy = RetryPolicy::new(BackoffStrategies::new());
        let job = job_with(10, Some(BackoffOptions::Delay(100)));
        assert_eq!(
            policy.decide(&job, 1, None, true).unwrap(),
            RetryDecision::Failed
        );
    }
}
