//! Job scheduler - persists repeatable definitions and materializes their
//! occurrences.
//!
//! One occurrence per series is outstanding at any time. The dispatcher
//! script inserts the next occurrence from a precomputed fire time when it
//! hands an occurrence to a worker; `advance` tops that precomputation up
//! (and re-materializes directly when a crash left nothing precomputed).

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::repeat::{
    self, default_strategy, occurrence_id, RepeatStrategy, RepeatableDefinition,
    RepeatableListItem,
};
use crate::domain::{Job, JobOptions, RepeatKeyHashAlgorithm, RepeatOptions};
use crate::error::Result;
use crate::port::store::{AddedJob, QueueStore};
use crate::port::TimeProvider;

pub struct JobScheduler {
    store: Arc<dyn QueueStore>,
    time_provider: Arc<dyn TimeProvider>,
    hash_algorithm: RepeatKeyHashAlgorithm,
    strategy: RepeatStrategy,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn QueueStore>,
        time_provider: Arc<dyn TimeProvider>,
        hash_algorithm: RepeatKeyHashAlgorithm,
        strategy: Option<RepeatStrategy>,
    ) -> Self {
        Self {
            store,
            time_provider,
            hash_algorithm,
            strategy: strategy.unwrap_or_else(default_strategy),
        }
    }

    /// Upsert a repeatable definition and its first occurrence.
    ///
    /// Two upserts sharing a key but differing in interval replace each
    /// other atomically; upserting an identical definition is idempotent on
    /// the fingerprint. Returns `None` when the series produces no
    /// occurrence (already exhausted by `endDate`/`limit` or terminated by
    /// the strategy).
    pub async fn upsert(
        &self,
        name: &str,
        data: &serde_json::Value,
        repeat: &RepeatOptions,
        template: &JobOptions,
    ) -> Result<Option<AddedJob>> {
        let now = self.time_provider.now_millis();
        repeat.validate(now)?;

        let key = repeat::repeat_key(name, repeat, self.hash_algorithm);
        let legacy = repeat
            .key
            .is_none()
            .then(|| repeat::legacy_key(name, repeat));

        let first = if repeat.immediately {
            Some(now)
        } else {
            (self.strategy)(now, repeat, name)?
        };
        let Some(first) = first else {
            debug!(name = %name, "Repeat strategy produced no occurrence");
            return Ok(None);
        };

        let mut template = template.clone();
        template.repeat = None;
        template.job_id = None;

        let mut def = RepeatableDefinition {
            key: key.clone(),
            name: name.to_string(),
            opts: repeat.clone(),
            count: 0,
            next: None,
            data: data.clone(),
            job_opts: template,
        };
        if def.exhausted(first) {
            debug!(name = %name, key = %key, "Series exhausted before first occurrence");
            return Ok(None);
        }
        def.count = 1;
        def.next = self.following(&def, first).await?;

        let occurrence = build_occurrence(&def, first, now);
        self.store
            .upsert_repeatable(&def, &occurrence, legacy.as_deref())
            .await?;

        info!(
            name = %name,
            key = %key,
            first_occurrence = %first,
            "Repeatable definition upserted"
        );
        Ok(Some(AddedJob::Created(occurrence.id)))
    }

    /// Advance the series after an occurrence was handed to a worker.
    ///
    /// `fired_millis` is the fire time encoded in the delivered occurrence
    /// id. When the dispatcher already inserted the outstanding occurrence,
    /// only the following fire time is precomputed; otherwise the next
    /// occurrence is materialized here.
    pub async fn advance(&self, key: &str, fired_millis: i64) -> Result<()> {
        let Some(stored) = self.store.get_repeatable(key).await? else {
            debug!(key = %key, "No definition for delivered occurrence");
            return Ok(());
        };
        let def = stored.def;

        match stored.outstanding {
            Some(outstanding) if outstanding > fired_millis => {
                let following = self.following(&def, outstanding).await?;
                self.store.advance_repeatable(key, None, following).await
            }
            _ => {
                let Some(next) = self.following(&def, fired_millis).await? else {
                    info!(key = %key, "Series terminated");
                    return self.store.advance_repeatable(key, None, None).await;
                };
                let now = self.time_provider.now_millis();
                let occurrence = build_occurrence(&def, next, now);
                let following = self.following(&def, next).await?;
                self.store
                    .advance_repeatable(key, Some(&occurrence), following)
                    .await
            }
        }
    }

    /// Remove a definition by its repeat options (both key shapes cleared).
    pub async fn remove(&self, name: &str, repeat: &RepeatOptions) -> Result<bool> {
        let key = repeat::repeat_key(name, repeat, self.hash_algorithm);
        let legacy = repeat
            .key
            .is_none()
            .then(|| repeat::legacy_key(name, repeat));
        self.remove_by_key_with_legacy(&key, legacy.as_deref()).await
    }

    /// Remove a definition by its key verbatim.
    pub async fn remove_by_key(&self, key: &str) -> Result<bool> {
        self.remove_by_key_with_legacy(key, None).await
    }

    async fn remove_by_key_with_legacy(&self, key: &str, legacy: Option<&str>) -> Result<bool> {
        let removed = self.store.remove_repeatable(key, legacy).await?;
        if removed {
            info!(key = %key, "Repeatable definition removed");
        }
        Ok(removed)
    }

    pub async fn list(
        &self,
        offset: i64,
        limit: i64,
        asc: bool,
    ) -> Result<Vec<RepeatableListItem>> {
        self.store.list_repeatable(offset, limit, asc).await
    }

    /// Next occurrence strictly after `after`, honoring `endDate`/`limit`.
    async fn following(&self, def: &RepeatableDefinition, after: i64) -> Result<Option<i64>> {
        let candidate = (self.strategy)(after + 1, &def.opts, &def.name)?;
        Ok(candidate.filter(|millis| !def.exhausted(*millis)))
    }
}

fn build_occurrence(def: &RepeatableDefinition, fire_millis: i64, now_millis: i64) -> Job {
    let mut opts = def.job_opts.clone();
    opts.delay = (fire_millis - now_millis).max(0);
    let mut job = Job::new(def.name.clone(), def.data.clone(), opts, now_millis);
    job.id = occurrence_id(&def.key, fire_millis);
    job.delay = (fire_millis - now_millis).max(0);
    job.repeat_job_key = Some(def.key.clone());
    job
}

/// Parse the fire time out of an occurrence id (`repeat:<key>:<millis>`).
pub fn occurrence_fire_millis(id: &str) -> Option<i64> {
    id.rsplit(':').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::MockStore;
    use crate::domain::DomainError;
    use crate::port::FixedTimeProvider;

    fn scheduler_at(now: i64, store: Arc<MockStore>) -> JobScheduler {
        JobScheduler::new(
            store,
            Arc::new(FixedTimeProvider(now)),
            RepeatKeyHashAlgorithm::Md5,
            None,
        )
    }

    fn every(ms: i64) -> RepeatOptions {
        RepeatOptions {
            every: Some(ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn upsert_inserts_first_occurrence_and_precomputes_next() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(1_000, store.clone());

        let added = scheduler
            .upsert("tick", &serde_json::json!({}), &every(800), &JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        // 1000 aligned up to the next multiple of 800
        assert_eq!(added.id(), format!("repeat:{}:1600", key_of("tick", 800)));

        let upserts = store.upserts.lock().unwrap();
        let (def, occurrence, legacy) = &upserts[0];
        assert_eq!(def.count, 1);
        assert_eq!(def.next, Some(2_400));
        assert_eq!(occurrence.delay, 600);
        assert_eq!(occurrence.repeat_job_key.as_deref(), Some(def.key.as_str()));
        assert!(legacy.is_some());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_the_fingerprint() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(1_000, store.clone());
        let opts = every(800);

        let a = scheduler
            .upsert("test", &serde_json::json!({}), &opts, &JobOptions::default())
            .await
            .unwrap()
            .unwrap();
        let b = scheduler
            .upsert("test", &serde_json::json!({}), &opts, &JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(store.repeatables.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn differing_intervals_replace_under_distinct_keys() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(1_000, store.clone());

        // A caller-supplied key pins the series regardless of interval
        for interval in [800, 400, 200] {
            let opts = RepeatOptions {
                every: Some(interval),
                key: Some("test".to_string()),
                ..Default::default()
            };
            scheduler
                .upsert("test", &serde_json::json!({}), &opts, &JobOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(store.repeatables.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn immediately_fires_at_upsert_time() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(12_345, store.clone());
        let opts = RepeatOptions {
            every: Some(1_000),
            immediately: true,
            ..Default::default()
        };

        scheduler
            .upsert("now", &serde_json::json!({}), &opts, &JobOptions::default())
            .await
            .unwrap()
            .unwrap();

        let upserts = store.upserts.lock().unwrap();
        let (_, occurrence, _) = &upserts[0];
        assert_eq!(occurrence.delay, 0);
        assert_eq!(occurrence.timestamp, 12_345);
    }

    #[tokio::test]
    async fn conflicting_options_fail_before_any_store_call() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(1_000, store.clone());
        let opts = RepeatOptions {
            pattern: Some("* * * * * *".to_string()),
            every: Some(100),
            ..Default::default()
        };

        let err = scheduler
            .upsert("bad", &serde_json::json!({}), &opts, &JobOptions::default())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Both .pattern and .every options are defined"));
        assert!(store.upserts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn past_end_date_is_rejected() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(10_000, store.clone());
        let opts = RepeatOptions {
            every: Some(100),
            end_date: Some(9_999),
            ..Default::default()
        };

        let err = scheduler
            .upsert("late", &serde_json::json!({}), &opts, &JobOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Domain error: End date must be greater than current timestamp"
        );
    }

    #[tokio::test]
    async fn advance_tops_up_precomputation_when_dispatcher_inserted() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(1_000, store.clone());
        scheduler
            .upsert("tick", &serde_json::json!({}), &every(800), &JobOptions::default())
            .await
            .unwrap();
        let key = key_of("tick", 800);

        // Simulate the dispatcher having inserted the 2400 occurrence when
        // the 1600 one was delivered
        {
            let mut repeatables = store.repeatables.lock().unwrap();
            let stored = repeatables.get_mut(&key).unwrap();
            stored.outstanding = Some(2_400);
            stored.def.next = None;
        }

        scheduler.advance(&key, 1_600).await.unwrap();

        let advances = store.advances.lock().unwrap();
        let (_, occurrence, next) = advances.last().unwrap();
        assert!(occurrence.is_none());
        assert_eq!(*next, Some(3_200));
    }

    #[tokio::test]
    async fn advance_materializes_after_missed_precomputation() {
        let store = Arc::new(MockStore::new("bull:q"));
        let scheduler = scheduler_at(1_700, store.clone());
        scheduler
            .upsert("tick", &serde_json::json!({}), &every(800), &JobOptions::default())
            .await
            .unwrap();
        let key = key_of("tick", 800);

        // Crash path: the 1600 occurrence was delivered but nothing was
        // precomputed, so no outstanding occurrence exists
        {
            let mut repeatables = store.repeatables.lock().unwrap();
            let stored = repeatables.get_mut(&key).unwrap();
            stored.outstanding = Some(1_600);
            stored.def.next = None;
        }

        scheduler.advance(&key, 1_600).await.unwrap();

        let advances = store.advances.lock().unwrap();
        let (_, occurrence, next) = advances.last().unwrap();
        let occurrence = occurrence.as_ref().unwrap();
        assert_eq!(occurrence.id, format!("repeat:{}:2400", key));
        assert_eq!(*next, Some(3_200));
    }

    #[tokio::test]
    async fn custom_strategy_errors_surface() {
        let store = Arc::new(MockStore::new("bull:q"));
        let strategy: RepeatStrategy =
            Arc::new(|_, _, _| Err(DomainError::MissingDtStart));
        let scheduler = JobScheduler::new(
            store,
            Arc::new(FixedTimeProvider(0)),
            RepeatKeyHashAlgorithm::Md5,
            Some(strategy),
        );

        let err = scheduler
            .upsert("rrule", &serde_json::json!({}), &every(10), &JobOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Domain error: DTSTART must be defined to use COUNT with rrule"
        );
    }

    fn key_of(name: &str, every_ms: i64) -> String {
        repeat::repeat_key(
            name,
            &every(every_ms),
            RepeatKeyHashAlgorithm::Md5,
        )
    }
}
