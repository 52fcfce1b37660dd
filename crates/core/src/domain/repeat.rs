// Repeatable job definitions - fingerprints, occurrence ids, next-occurrence math

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use md5::{Digest, Md5};
use sha2::Sha256;

use super::error::{DomainError, Result};
use super::options::{JobOptions, RepeatKeyHashAlgorithm, RepeatOptions};

/// Id prefix shared by every materialized occurrence of a scheduler.
pub const REPEAT_ID_PREFIX: &str = "repeat";

/// Custom next-occurrence hook: `(millis, opts, name) -> next | None`.
/// Returning `None` terminates the series.
pub type RepeatStrategy =
    Arc<dyn Fn(i64, &RepeatOptions, &str) -> Result<Option<i64>> + Send + Sync>;

/// Stable fingerprint for a definition: `name::jobId::endDate::tz::suffix`.
pub fn fingerprint(name: &str, opts: &RepeatOptions) -> String {
    let job_id = opts.job_id.as_deref().unwrap_or("");
    let end_date = opts
        .end_date
        .map(|d| d.to_string())
        .unwrap_or_default();
    let tz = opts.tz.as_deref().unwrap_or("");
    format!(
        "{}::{}::{}::{}::{}",
        name,
        job_id,
        end_date,
        tz,
        opts.suffix()
    )
}

/// Pre-hash key shape used by old deployments: the same fields joined by
/// single colons, stored verbatim. Lookup and removal recognize both shapes.
pub fn legacy_key(name: &str, opts: &RepeatOptions) -> String {
    let job_id = opts.job_id.as_deref().unwrap_or("");
    let end_date = opts
        .end_date
        .map(|d| d.to_string())
        .unwrap_or_default();
    let tz = opts.tz.as_deref().unwrap_or("");
    format!("{}:{}:{}:{}:{}", name, job_id, end_date, tz, opts.suffix())
}

/// Hash the fingerprint into the definition key.
pub fn hash_fingerprint(fingerprint: &str, algorithm: RepeatKeyHashAlgorithm) -> String {
    match algorithm {
        RepeatKeyHashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(fingerprint.as_bytes());
            hex::encode(hasher.finalize())
        }
        RepeatKeyHashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(fingerprint.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

/// The definition key for a scheduler: the caller-supplied `key` verbatim,
/// otherwise the hashed fingerprint.
pub fn repeat_key(name: &str, opts: &RepeatOptions, algorithm: RepeatKeyHashAlgorithm) -> String {
    match &opts.key {
        Some(key) => key.clone(),
        None => hash_fingerprint(&fingerprint(name, opts), algorithm),
    }
}

/// Id of the materialized occurrence firing at `millis`.
pub fn occurrence_id(key: &str, millis: i64) -> String {
    format!("{}:{}:{}", REPEAT_ID_PREFIX, key, millis)
}

/// Whether a job id belongs to a scheduler series.
pub fn is_occurrence_id(id: &str) -> bool {
    id.starts_with("repeat:")
}

/// A persisted repeatable definition. Lives in the `repeat:<key>` hash; the
/// `repeat` zset orders definition keys by their next fire time.
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatableDefinition {
    pub key: String,
    pub name: String,
    pub opts: RepeatOptions,
    /// Occurrences produced so far
    pub count: u64,
    /// Precomputed fire time of the occurrence after the outstanding one;
    /// consumed by the dispatcher when it advances the series
    pub next: Option<i64>,
    /// Template payload for materialized occurrences
    pub data: serde_json::Value,
    /// Template job options for materialized occurrences (repeat stripped)
    pub job_opts: JobOptions,
}

impl RepeatableDefinition {
    /// Flatten into hash pairs. `endDate`/`tz` keep the empty-string vs
    /// absent distinction on the wire.
    pub fn to_store_pairs(&self) -> std::result::Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut pairs = vec![
            ("name", self.name.clone()),
            ("count", self.count.to_string()),
            ("data", serde_json::to_string(&self.data)?),
            ("opts", serde_json::to_string(&self.opts)?),
            ("jobOpts", serde_json::to_string(&self.job_opts)?),
        ];
        if let Some(pattern) = &self.opts.pattern {
            pairs.push(("pattern", pattern.clone()));
        }
        if let Some(every) = self.opts.every {
            pairs.push(("every", every.to_string()));
        }
        if let Some(tz) = &self.opts.tz {
            pairs.push(("tz", tz.clone()));
        }
        if let Some(end_date) = self.opts.end_date {
            pairs.push(("endDate", end_date.to_string()));
        }
        if let Some(limit) = self.opts.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if let Some(next) = self.next {
            pairs.push(("next", next.to_string()));
        }
        Ok(pairs)
    }

    pub fn from_store_map(
        key: impl Into<String>,
        map: &HashMap<String, String>,
    ) -> std::result::Result<Self, serde_json::Error> {
        let opts: RepeatOptions = match map.get("opts") {
            Some(raw) => serde_json::from_str(raw)?,
            None => RepeatOptions {
                // Legacy definitions carry discrete fields only
                pattern: map.get("pattern").cloned(),
                every: map.get("every").and_then(|v| v.parse().ok()),
                tz: map.get("tz").cloned(),
                end_date: map.get("endDate").and_then(|v| v.parse().ok()),
                limit: map.get("limit").and_then(|v| v.parse().ok()),
                ..Default::default()
            },
        };
        let data = match map.get("data") {
            Some(raw) => serde_json::from_str(raw)?,
            None => serde_json::Value::Null,
        };
        let job_opts: JobOptions = match map.get("jobOpts") {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        Ok(Self {
            key: key.into(),
            name: map.get("name").cloned().unwrap_or_default(),
            count: map.get("count").and_then(|v| v.parse().ok()).unwrap_or(0),
            next: map.get("next").and_then(|v| v.parse().ok()),
            opts,
            data,
            job_opts,
        })
    }

    /// Series termination check against `endDate` and `limit`.
    pub fn exhausted(&self, candidate_millis: i64) -> bool {
        if let Some(end_date) = self.opts.end_date {
            if candidate_millis > end_date {
                return true;
            }
        }
        if let Some(limit) = self.opts.limit {
            if self.count >= limit {
                return true;
            }
        }
        false
    }
}

/// Listing row returned by `getRepeatableJobs`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatableListItem {
    pub key: String,
    pub name: String,
    pub end_date: Option<i64>,
    pub tz: Option<String>,
    pub pattern: Option<String>,
    pub every: Option<i64>,
    pub next: i64,
}

/// Default next-occurrence strategy.
///
/// `every` intervals align to multiples of the interval; cron patterns are
/// evaluated by the cron engine in the definition's timezone. `immediately`
/// is resolved by the caller (the first occurrence fires at upsert time).
pub fn default_next_occurrence(millis: i64, opts: &RepeatOptions, _name: &str) -> Result<Option<i64>> {
    if let Some(every) = opts.every {
        if every <= 0 {
            return Ok(None);
        }
        let anchor = opts.start_date.unwrap_or(0);
        let elapsed = millis - anchor;
        let steps = if elapsed <= 0 {
            0
        } else {
            (elapsed + every - 1) / every
        };
        return Ok(Some(anchor + steps * every));
    }

    let Some(pattern) = &opts.pattern else {
        return Ok(None);
    };
    let schedule = parse_pattern(pattern)?;
    let after = opts.start_date.map_or(millis, |start| millis.max(start));

    let next = if opts.utc || opts.tz.is_none() {
        let dt = utc_from_millis(after)?;
        schedule.after(&dt).next().map(|d| d.timestamp_millis())
    } else {
        let tz_name = opts.tz.as_deref().unwrap_or("UTC");
        let tz: Tz = tz_name
            .parse()
            .map_err(|_| DomainError::InvalidTimezone(tz_name.to_string()))?;
        let dt = tz.timestamp_millis_opt(after).single().ok_or_else(|| {
            DomainError::InvalidTimezone(tz_name.to_string())
        })?;
        schedule.after(&dt).next().map(|d| d.timestamp_millis())
    };
    Ok(next)
}

fn utc_from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| DomainError::InvalidPattern(format!("timestamp out of range: {}", millis)))
}

/// Parse a cron pattern, accepting the five-field form by prepending a
/// seconds column of `0`.
fn parse_pattern(pattern: &str) -> Result<cron::Schedule> {
    let fields = pattern.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", pattern)
    } else {
        pattern.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| DomainError::InvalidPattern(format!("{}: {}", pattern, e)))
}

/// Wrap the default strategy as a `RepeatStrategy` handle.
pub fn default_strategy() -> RepeatStrategy {
    Arc::new(default_next_occurrence)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_opts(every: i64) -> RepeatOptions {
        RepeatOptions {
            every: Some(every),
            ..Default::default()
        }
    }

    #[test]
    fn fingerprint_layout_is_stable() {
        let opts = RepeatOptions {
            pattern: Some("*/5 * * * *".to_string()),
            tz: Some("Europe/Madrid".to_string()),
            end_date: Some(1_700_000_000_000),
            job_id: Some("custom".to_string()),
            ..Default::default()
        };
        assert_eq!(
            fingerprint("report", &opts),
            "report::custom::1700000000000::Europe/Madrid::*/5 * * * *"
        );
        assert_eq!(
            legacy_key("report", &opts),
            "report:custom:1700000000000:Europe/Madrid:*/5 * * * *"
        );
    }

    #[test]
    fn same_inputs_hash_identically() {
        let opts = every_opts(800);
        let a = repeat_key("test", &opts, RepeatKeyHashAlgorithm::Md5);
        let b = repeat_key("test", &opts, RepeatKeyHashAlgorithm::Md5);
        assert_eq!(a, b);

        let sha = repeat_key("test", &opts, RepeatKeyHashAlgorithm::Sha256);
        assert_ne!(a, sha);
        assert_eq!(sha.len(), 64);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn caller_key_is_used_verbatim() {
        let opts = RepeatOptions {
            every: Some(800),
            key: Some("my-series".to_string()),
            ..Default::default()
        };
        assert_eq!(
            repeat_key("test", &opts, RepeatKeyHashAlgorithm::Md5),
            "my-series"
        );
    }

    #[test]
    fn occurrence_ids_carry_key_and_millis() {
        assert_eq!(occurrence_id("abc", 1234), "repeat:abc:1234");
        assert!(is_occurrence_id("repeat:abc:1234"));
        assert!(!is_occurrence_id("42"));
    }

    #[test]
    fn every_aligns_to_interval_multiples() {
        let opts = every_opts(1000);
        let next = default_next_occurrence(1, &opts, "t").unwrap().unwrap();
        assert_eq!(next, 1000);
        let next = default_next_occurrence(1000, &opts, "t").unwrap().unwrap();
        assert_eq!(next, 1000);
        let next = default_next_occurrence(1001, &opts, "t").unwrap().unwrap();
        assert_eq!(next, 2000);
    }

    #[test]
    fn every_respects_start_date_anchor() {
        let opts = RepeatOptions {
            every: Some(500),
            start_date: Some(10_250),
            ..Default::default()
        };
        let next = default_next_occurrence(10_400, &opts, "t").unwrap().unwrap();
        assert_eq!(next, 10_750);
        let next = default_next_occurrence(9_000, &opts, "t").unwrap().unwrap();
        assert_eq!(next, 10_250);
    }

    #[test]
    fn cron_pattern_advances_in_two_second_steps() {
        // 2017-02-07 09:24:00 UTC
        let base = 1_486_459_440_000_i64;
        let opts = RepeatOptions {
            pattern: Some("*/2 * * * * *".to_string()),
            utc: true,
            ..Default::default()
        };
        let mut millis = base;
        let mut fires = Vec::new();
        for _ in 0..5 {
            let next = default_next_occurrence(millis, &opts, "t").unwrap().unwrap();
            fires.push(next);
            millis = next;
        }
        for pair in fires.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= 2000 && gap <= 2500, "gap was {}", gap);
        }
    }

    #[test]
    fn five_field_patterns_are_accepted() {
        let opts = RepeatOptions {
            pattern: Some("*/5 * * * *".to_string()),
            utc: true,
            ..Default::default()
        };
        let next = default_next_occurrence(1_486_459_440_000, &opts, "t")
            .unwrap()
            .unwrap();
        assert!(next > 1_486_459_440_000);
        assert_eq!(next % 300_000, 0);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let opts = RepeatOptions {
            pattern: Some("not a cron".to_string()),
            ..Default::default()
        };
        assert!(default_next_occurrence(0, &opts, "t").is_err());
    }

    #[test]
    fn definition_round_trip_preserves_empty_tz() {
        let def = RepeatableDefinition {
            key: "k".to_string(),
            name: "report".to_string(),
            opts: RepeatOptions {
                every: Some(800),
                tz: Some(String::new()),
                ..Default::default()
            },
            count: 3,
            next: Some(99_000),
            data: serde_json::json!({"n": 1}),
            job_opts: JobOptions::default(),
        };
        let map: HashMap<String, String> = def
            .to_store_pairs()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = RepeatableDefinition::from_store_map("k", &map).unwrap();
        assert_eq!(restored, def);
        assert_eq!(restored.opts.tz, Some(String::new()));

        let def_no_tz = RepeatableDefinition {
            opts: RepeatOptions {
                every: Some(800),
                tz: None,
                ..Default::default()
            },
            ..def
        };
        let map: HashMap<String, String> = def_no_tz
            .to_store_pairs()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = RepeatableDefinition::from_store_map("k", &map).unwrap();
        assert_eq!(restored.opts.tz, None);
    }

    #[test]
    fn exhaustion_honors_end_date_and_limit() {
        let mut def = RepeatableDefinition {
            key: "k".to_string(),
            name: "t".to_string(),
            opts: RepeatOptions {
                every: Some(100),
                end_date: Some(5_000),
                limit: Some(3),
                ..Default::default()
            },
            count: 0,
            next: None,
            data: serde_json::Value::Null,
            job_opts: JobOptions::default(),
        };
        assert!(!def.exhausted(4_000));
        assert!(def.exhausted(5_001));
        def.count = 3;
        assert!(def.exhausted(100));
    }
}
