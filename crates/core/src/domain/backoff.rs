// Backoff strategies - fixed, exponential, and caller-registered custom ones

use std::collections::HashMap;
use std::sync::Arc;

use super::error::{DomainError, Result};
use super::job::Job;
use super::options::BackoffOptions;

/// Custom strategy signature: `(attempts_made, failure_message, job) -> delay_ms`.
/// A non-positive return value skips the delay.
pub type CustomBackoff = Arc<dyn Fn(u32, Option<&str>, &Job) -> i64 + Send + Sync>;

/// Registered strategy table, keyed by the `backoff.type` string.
#[derive(Clone, Default)]
pub struct BackoffStrategies {
    strategies: HashMap<String, CustomBackoff>,
}

impl BackoffStrategies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        strategy: impl Fn(u32, Option<&str>, &Job) -> i64 + Send + Sync + 'static,
    ) {
        self.strategies.insert(name.into(), Arc::new(strategy));
    }

    /// Resolve the backoff delay for a failed job.
    ///
    /// `attempts_made` is the counter after the current failure was counted,
    /// so the first failure computes with `attempts_made == 1`.
    pub fn compute(
        &self,
        backoff: Option<&BackoffOptions>,
        attempts_made: u32,
        failure: Option<&str>,
        job: &Job,
    ) -> Result<i64> {
        let Some(backoff) = backoff else {
            return Ok(0);
        };
        match backoff {
            BackoffOptions::Delay(delay) => Ok(*delay),
            BackoffOptions::Strategy { kind, delay, .. } => match kind.as_str() {
                "fixed" => Ok(delay.unwrap_or(0)),
                "exponential" => {
                    let base = delay.unwrap_or(0);
                    let exponent = attempts_made.saturating_sub(1).min(62);
                    Ok(base.saturating_mul(1_i64 << exponent))
                }
                name => match self.strategies.get(name) {
                    Some(strategy) => Ok(strategy(attempts_made, failure, job).max(0)),
                    None => Err(DomainError::UnknownBackoffStrategy(name.to_string())),
                },
            },
        }
    }
}

impl std::fmt::Debug for BackoffStrategies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffStrategies")
            .field("registered", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}
