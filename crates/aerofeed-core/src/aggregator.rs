//! Concurrent multi-source queries with identity dedupe and priority merge.
//!
//! Every eligible source is fetched concurrently on the caller's task; dropping
//! the [`SourceAggregator::query`] future cancels all pending fetches. Records
//! are grouped by identity key and merged field by field: sources are visited
//! in ascending priority (ties broken by source id, then newest observation)
//! and the first non-null value for a field wins.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::duration_secs;
use crate::data_source::{DataSource, SourceError};
use crate::executor::RequestExecutor;
use crate::{CanonicalRecord, FieldMap, QueryTarget, SourceRecord, UtcDateTime, ValidationError};

const CANONICAL_KEY_PREFIX: &str = "canonical:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Upper bound for one source's whole fetch, retries included.
    #[serde(rename = "per_source_timeout_secs", with = "duration_secs")]
    pub per_source_timeout: Duration,
    /// Canonical records whose oldest contribution is older than this are flagged stale.
    #[serde(rename = "freshness_threshold_secs", with = "duration_secs")]
    pub freshness_threshold: Duration,
    /// `false` returns every per-source record unmerged and uncached.
    pub merge_enabled: bool,
    pub canonical_namespace: String,
    #[serde(rename = "canonical_ttl_secs", with = "duration_secs")]
    pub canonical_ttl: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            per_source_timeout: Duration::from_secs(15),
            freshness_threshold: Duration::from_secs(300),
            merge_enabled: true,
            canonical_namespace: String::from("canonical"),
            canonical_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    Unsupported,
    CircuitOpen,
}

/// What happened to one source during a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Ok { records: usize },
    Skipped { reason: SkipReason },
    Failed { code: String, message: String },
    TimedOut { after_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub priority: u32,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub elapsed_ms: u64,
}

impl SourceOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, SourceStatus::Ok { .. })
    }
}

/// Result of one aggregator query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateReport {
    pub target: QueryTarget,
    pub records: Vec<CanonicalRecord>,
    pub outcomes: Vec<SourceOutcome>,
    pub merged: bool,
    /// Records came from the canonical cache because no source answered.
    pub from_cache: bool,
}

/// Fans a query out to every registered source and merges the answers.
pub struct SourceAggregator {
    executor: RequestExecutor,
    sources: Vec<Arc<dyn DataSource>>,
    config: AggregatorConfig,
}

impl std::fmt::Debug for SourceAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceAggregator")
            .field("sources", &self.source_ids())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SourceAggregator {
    pub fn new(executor: RequestExecutor, config: AggregatorConfig) -> Self {
        Self {
            executor,
            sources: Vec::new(),
            config,
        }
    }

    /// Adds a source. Source ids must be unique.
    pub fn register(&mut self, source: Arc<dyn DataSource>) -> Result<(), ValidationError> {
        if self.sources.iter().any(|existing| existing.id() == source.id()) {
            return Err(ValidationError::DuplicateSource {
                id: source.id().to_owned(),
            });
        }
        self.sources.push(source);
        Ok(())
    }

    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Result<Self, ValidationError> {
        self.register(source)?;
        Ok(self)
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.id()).collect()
    }

    pub fn sources(&self) -> &[Arc<dyn DataSource>] {
        &self.sources
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub async fn query(&self, target: &QueryTarget) -> AggregateReport {
        self.query_with(target, self.config.merge_enabled).await
    }

    /// Like [`query`](Self::query) with an explicit merge mode.
    pub async fn query_with(&self, target: &QueryTarget, merge: bool) -> AggregateReport {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(self.sources.len());
        let mut eligible = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let skipped = if !source.enabled() {
                Some(SkipReason::Disabled)
            } else if !source.supports(target) {
                Some(SkipReason::Unsupported)
            } else if !self.executor.breaker().allow(source.service_name()) {
                Some(SkipReason::CircuitOpen)
            } else {
                None
            };

            match skipped {
                Some(reason) => outcomes.push(SourceOutcome {
                    source_id: source.id().to_owned(),
                    priority: source.priority(),
                    status: SourceStatus::Skipped { reason },
                    elapsed_ms: 0,
                }),
                None => eligible.push(Arc::clone(source)),
            }
        }

        let fetched = join_all(eligible.iter().map(|source| self.fetch_one(source.as_ref(), target))).await;

        let now = UtcDateTime::now();
        let mut records = Vec::new();
        for (outcome, source_records) in fetched {
            outcomes.push(outcome);
            records.extend(source_records);
        }
        outcomes.sort_by(|left, right| {
            (left.priority, &left.source_id).cmp(&(right.priority, &right.source_id))
        });

        let records = filter_for_target(records, target, now);
        let any_succeeded = outcomes.iter().any(SourceOutcome::succeeded);

        let report = if !merge {
            AggregateReport {
                target: target.clone(),
                records: unmerged_records(records, self.config.freshness_threshold, now),
                outcomes,
                merged: false,
                from_cache: false,
            }
        } else if !any_succeeded {
            let records = self.cached_fallback(target).await;
            let from_cache = !records.is_empty();
            AggregateReport {
                target: target.clone(),
                records,
                outcomes,
                merged: true,
                from_cache,
            }
        } else {
            let merged = merge_records(records, self.config.freshness_threshold, now);
            self.store_canonical(&merged).await;
            AggregateReport {
                target: target.clone(),
                records: merged,
                outcomes,
                merged: true,
                from_cache: false,
            }
        };

        tracing::debug!(
            target = %target,
            records = report.records.len(),
            sources = report.outcomes.len(),
            from_cache = report.from_cache,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "aggregate query finished"
        );
        report
    }

    async fn fetch_one(
        &self,
        source: &dyn DataSource,
        target: &QueryTarget,
    ) -> (SourceOutcome, Vec<SourceRecord>) {
        let timeout = source.timeout().unwrap_or(self.config.per_source_timeout);
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, source.fetch(&self.executor, target)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (status, records) = match result {
            Ok(Ok(mut records)) => {
                for record in &mut records {
                    record.source_id = source.id().to_owned();
                    record.priority = source.priority();
                }
                (
                    SourceStatus::Ok {
                        records: records.len(),
                    },
                    records,
                )
            }
            Ok(Err(error)) => {
                log_source_failure(source.id(), &error);
                (
                    SourceStatus::Failed {
                        code: error.code().to_owned(),
                        message: error.message().to_owned(),
                    },
                    Vec::new(),
                )
            }
            Err(_) => {
                tracing::warn!(source = source.id(), timeout_ms = timeout.as_millis() as u64, "source timed out");
                (
                    SourceStatus::TimedOut {
                        after_ms: timeout.as_millis() as u64,
                    },
                    Vec::new(),
                )
            }
        };

        let outcome = SourceOutcome {
            source_id: source.id().to_owned(),
            priority: source.priority(),
            status,
            elapsed_ms,
        };
        (outcome, records)
    }

    async fn store_canonical(&self, records: &[CanonicalRecord]) {
        let cache = self.executor.cache();
        for record in records {
            let value = match serde_json::to_value(record) {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(identity_key = %record.identity_key, %error, "canonical record not cacheable");
                    continue;
                }
            };
            let key = canonical_key(&record.identity_key);
            if let Err(error) = cache
                .set(
                    &self.config.canonical_namespace,
                    &key,
                    value,
                    Some(self.config.canonical_ttl),
                )
                .await
            {
                tracing::warn!(identity_key = %record.identity_key, %error, "failed to cache canonical record");
            }
        }
    }

    async fn cached_fallback(&self, target: &QueryTarget) -> Vec<CanonicalRecord> {
        let Some(identity_key) = target.identity_key() else {
            return Vec::new();
        };

        let ceiling = self.executor.config().stale_ceiling;
        let Some(read) = self
            .executor
            .cache()
            .get_with_stale(&self.config.canonical_namespace, &canonical_key(identity_key), ceiling)
            .await
        else {
            return Vec::new();
        };

        match serde_json::from_value::<CanonicalRecord>(read.value) {
            Ok(mut record) => {
                record.is_stale = record.is_stale || read.is_stale;
                tracing::info!(
                    identity_key,
                    age_secs = read.age.as_secs(),
                    is_stale = record.is_stale,
                    "no source answered; serving cached canonical record"
                );
                vec![record]
            }
            Err(error) => {
                tracing::warn!(identity_key, %error, "cached canonical record has unexpected shape");
                Vec::new()
            }
        }
    }
}

fn log_source_failure(source: &str, error: &SourceError) {
    if error.retryable() {
        tracing::warn!(source, code = error.code(), error = error.message(), "source failed");
    } else {
        tracing::info!(source, code = error.code(), error = error.message(), "source failed");
    }
}

pub fn canonical_key(identity_key: &str) -> String {
    format!("{CANONICAL_KEY_PREFIX}{identity_key}")
}

/// Area targets drop records outside the radius or older than `max_age`.
fn filter_for_target(
    records: Vec<SourceRecord>,
    target: &QueryTarget,
    now: UtcDateTime,
) -> Vec<SourceRecord> {
    let QueryTarget::Area(area) = target else {
        return records;
    };

    records
        .into_iter()
        .filter(|record| {
            area.max_age
                .is_none_or(|max_age| record.observed_at.age_at(now) <= max_age)
        })
        .filter(|record| {
            record
                .position()
                .is_none_or(|(latitude, longitude)| area.contains(latitude, longitude))
        })
        .collect()
}

/// Groups records by identity key and merges each group by priority.
///
/// Output is sorted by identity key and does not depend on input order.
pub fn merge_records(
    records: Vec<SourceRecord>,
    freshness_threshold: Duration,
    now: UtcDateTime,
) -> Vec<CanonicalRecord> {
    let mut groups: BTreeMap<String, Vec<SourceRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.identity_key.clone())
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .filter_map(|(identity_key, group)| merge_group(identity_key, group, freshness_threshold, now))
        .collect()
}

fn merge_group(
    identity_key: String,
    mut group: Vec<SourceRecord>,
    freshness_threshold: Duration,
    now: UtcDateTime,
) -> Option<CanonicalRecord> {
    group.sort_by(|left, right| {
        left.priority
            .cmp(&right.priority)
            .then_with(|| left.source_id.cmp(&right.source_id))
            .then_with(|| right.observed_at.cmp(&left.observed_at))
    });

    let observed_at = group.iter().map(|record| record.observed_at).min()?;
    let served_stale = group.iter().any(|record| record.is_stale);
    let mut fields = FieldMap::new();
    let mut provenance = BTreeMap::new();
    let mut contributing_sources = Vec::new();
    let mut seen_sources = HashSet::new();

    for record in group {
        if seen_sources.insert(record.source_id.clone()) {
            contributing_sources.push(record.source_id.clone());
        }
        for (name, value) in record.fields {
            if value.is_null() {
                fields.entry(name).or_insert(value);
                continue;
            }
            let populated = fields.get(&name).is_some_and(|existing| !existing.is_null());
            if !populated {
                provenance.insert(name.clone(), record.source_id.clone());
                fields.insert(name, value);
            }
        }
    }

    Some(CanonicalRecord {
        identity_key,
        fields,
        contributing_sources,
        provenance,
        observed_at,
        is_stale: served_stale || observed_at.age_at(now) > freshness_threshold,
    })
}

/// Debug view: one record per source report, tagged with that source only.
fn unmerged_records(
    mut records: Vec<SourceRecord>,
    freshness_threshold: Duration,
    now: UtcDateTime,
) -> Vec<CanonicalRecord> {
    records.sort_by(|left, right| {
        (&left.identity_key, left.priority, &left.source_id)
            .cmp(&(&right.identity_key, right.priority, &right.source_id))
    });

    records
        .into_iter()
        .map(|record| {
            let provenance = record
                .fields
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(name, _)| (name.clone(), record.source_id.clone()))
                .collect();
            CanonicalRecord {
                identity_key: record.identity_key,
                fields: record.fields,
                contributing_sources: vec![record.source_id],
                provenance,
                observed_at: record.observed_at,
                is_stale: record.is_stale || record.observed_at.age_at(now) > freshness_threshold,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn at(input: &str) -> UtcDateTime {
        UtcDateTime::parse(input).expect("valid timestamp")
    }

    fn record(source: &str, priority: u32, key: &str, observed: &str) -> SourceRecord {
        SourceRecord::new(source, priority, key, at(observed)).expect("valid record")
    }

    #[test]
    fn higher_priority_wins_and_lower_fills_gaps() {
        let now = at("2024-05-01T12:00:30Z");
        let records = vec![
            record("opensky", 2, "abc123", "2024-05-01T12:00:00Z")
                .with_field("altitude_ft", 35_000)
                .with_field("squawk", "7000"),
            record("readsb", 1, "abc123", "2024-05-01T12:00:10Z")
                .with_field("altitude_ft", 35_025)
                .with_optional_field::<String>("squawk", None),
        ];

        let merged = merge_records(records, Duration::from_secs(60), now);

        assert_eq!(merged.len(), 1);
        let canonical = &merged[0];
        assert_eq!(canonical.field("altitude_ft"), Some(&Value::from(35_025)));
        assert_eq!(canonical.field("squawk"), Some(&Value::from("7000")));
        assert_eq!(canonical.contributing_sources, vec!["readsb", "opensky"]);
        assert_eq!(canonical.provenance["altitude_ft"], "readsb");
        assert_eq!(canonical.provenance["squawk"], "opensky");
        assert_eq!(canonical.observed_at, at("2024-05-01T12:00:00Z"));
        assert!(!canonical.is_stale);
    }

    #[test]
    fn merge_is_order_independent() {
        let now = at("2024-05-01T12:05:00Z");
        let a = record("a", 1, "x", "2024-05-01T12:00:00Z").with_field("v", 1);
        let b = record("b", 1, "x", "2024-05-01T12:00:00Z").with_field("v", 2);
        let c = record("c", 0, "y", "2024-05-01T12:00:00Z").with_field("v", 3);

        let forward = merge_records(vec![a.clone(), b.clone(), c.clone()], Duration::from_secs(600), now);
        let backward = merge_records(vec![c, b, a], Duration::from_secs(600), now);

        assert_eq!(forward, backward);
        assert_eq!(forward[0].field("v"), Some(&Value::from(1)), "tie broken by source id");
    }

    #[test]
    fn newest_observation_wins_within_same_source() {
        let now = at("2024-05-01T12:05:00Z");
        let old = record("readsb", 1, "x", "2024-05-01T12:00:00Z").with_field("track_deg", 90);
        let new = record("readsb", 1, "x", "2024-05-01T12:01:00Z").with_field("track_deg", 95);

        let merged = merge_records(vec![old, new], Duration::from_secs(600), now);

        assert_eq!(merged[0].field("track_deg"), Some(&Value::from(95)));
        assert_eq!(merged[0].contributing_sources, vec!["readsb"]);
    }

    #[test]
    fn stale_flag_follows_oldest_contribution() {
        let now = at("2024-05-01T12:10:00Z");
        let records = vec![
            record("a", 1, "x", "2024-05-01T12:09:00Z").with_field("v", 1),
            record("b", 2, "x", "2024-05-01T12:00:00Z").with_field("w", 2),
        ];

        let merged = merge_records(records, Duration::from_secs(300), now);
        assert!(merged[0].is_stale);
    }

    #[test]
    fn any_stale_contribution_marks_the_merge_stale() {
        let now = at("2024-05-01T12:00:30Z");
        let mut cached = record("b", 2, "x", "2024-05-01T12:00:20Z").with_field("w", 2);
        cached.is_stale = true;
        let records = vec![record("a", 1, "x", "2024-05-01T12:00:25Z").with_field("v", 1), cached];

        let merged = merge_records(records, Duration::from_secs(300), now);

        assert!(merged[0].is_stale);
    }

    #[test]
    fn all_null_field_stays_null_without_provenance() {
        let now = at("2024-05-01T12:00:00Z");
        let records = vec![record("a", 1, "x", "2024-05-01T12:00:00Z")
            .with_optional_field::<String>("registration", None)];

        let merged = merge_records(records, Duration::from_secs(300), now);

        assert_eq!(merged[0].fields.get("registration"), Some(&Value::Null));
        assert!(merged[0].provenance.is_empty());
    }

    #[test]
    fn area_filter_drops_far_and_old_records() {
        let now = at("2024-05-01T12:00:00Z");
        let center = crate::GeoPoint::new(40.64, -73.78).expect("valid");
        let area = crate::AreaFilter::new(center, 20.0)
            .expect("valid")
            .with_max_age(Duration::from_secs(60));
        let target = QueryTarget::area(area);

        let near = record("a", 1, "near", "2024-05-01T11:59:30Z")
            .with_field("latitude", 40.70)
            .with_field("longitude", -73.80);
        let far = record("a", 1, "far", "2024-05-01T11:59:30Z")
            .with_field("latitude", 42.0)
            .with_field("longitude", -73.80);
        let old = record("a", 1, "old", "2024-05-01T11:50:00Z")
            .with_field("latitude", 40.70)
            .with_field("longitude", -73.80);

        let kept = filter_for_target(vec![near, far, old], &target, now);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].identity_key, "near");
    }
}
