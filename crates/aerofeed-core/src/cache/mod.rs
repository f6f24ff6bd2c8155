//! Two-tier key/value cache with TTL, LRU-bounded memory and namespace isolation.
//!
//! The memory tier is authoritative for the running process; the persistent
//! tier (one JSON file per key) survives restarts and backs memory misses.
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | [`CacheStore::get`] | Fresh value only |
//! | [`CacheStore::get_with_stale`] | Freshest value within a [`StaleCeiling`], flagged when stale |
//! | [`CacheStore::set`] | Memory updated before returning, file written in the background |
//! | [`CacheStore::delete`] / [`CacheStore::clear`] | Remove from both tiers |
//! | [`CacheStore::stats`] | Per-namespace counters |
//! | [`CacheStore::sweep`] | Best-effort age-based cleanup of both tiers |

mod disk;
mod entry;
mod memory;
mod stats;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::duration_secs;
use crate::notify::Notifier;
use crate::{UtcDateTime, ValidationError};

use disk::DiskTier;
use memory::MemoryTier;

pub use entry::CacheEntry;
pub use stats::CacheStats;

const DEFAULT_MAX_ENTRIES: usize = 512;
const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_STALE_CEILING: Duration = Duration::from_secs(2 * 24 * 60 * 60);

/// Cache sizing and placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root of the persistent tier. `None` keeps every namespace memory-only.
    pub root_dir: Option<PathBuf>,
    /// Memory-tier capacity per namespace.
    pub max_entries: usize,
    #[serde(rename = "default_ttl_secs", with = "duration_secs")]
    pub default_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: None,
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: DEFAULT_TTL,
        }
    }
}

impl CacheConfig {
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(root_dir.into());
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// How old a value may be and still be served by a stale read.
///
/// Serialized as a number of seconds or the string `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StaleCeilingRepr", into = "StaleCeilingRepr")]
pub enum StaleCeiling {
    Unlimited,
    Within(Duration),
}

impl Default for StaleCeiling {
    fn default() -> Self {
        Self::Within(DEFAULT_STALE_CEILING)
    }
}

impl StaleCeiling {
    pub fn allows(self, age: Duration) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Within(max) => age <= max,
        }
    }

    pub fn as_duration(self) -> Option<Duration> {
        match self {
            Self::Unlimited => None,
            Self::Within(max) => Some(max),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StaleCeilingRepr {
    Seconds(u64),
    Keyword(String),
}

impl TryFrom<StaleCeilingRepr> for StaleCeiling {
    type Error = String;

    fn try_from(value: StaleCeilingRepr) -> Result<Self, Self::Error> {
        match value {
            StaleCeilingRepr::Seconds(seconds) => Ok(Self::Within(Duration::from_secs(seconds))),
            StaleCeilingRepr::Keyword(keyword) if keyword.eq_ignore_ascii_case("unlimited") => {
                Ok(Self::Unlimited)
            }
            StaleCeilingRepr::Keyword(other) => Err(format!(
                "stale ceiling must be a number of seconds or \"unlimited\", got \"{other}\""
            )),
        }
    }
}

impl From<StaleCeiling> for StaleCeilingRepr {
    fn from(value: StaleCeiling) -> Self {
        match value {
            StaleCeiling::Unlimited => Self::Keyword(String::from("unlimited")),
            StaleCeiling::Within(max) => Self::Seconds(max.as_secs()),
        }
    }
}

/// A fresh cache hit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub value: Value,
    pub age: Duration,
}

/// Result of a stale-tolerant read.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleRead {
    pub value: Value,
    pub age: Duration,
    /// The value is older than its TTL.
    pub is_stale: bool,
}

/// Outcome of a [`CacheStore::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub memory_removed: usize,
    pub files_removed: usize,
}

#[derive(Debug)]
struct Namespace {
    memory: MemoryTier,
    stats: CacheStats,
}

#[derive(Debug)]
struct CacheInner {
    config: CacheConfig,
    namespaces: Mutex<HashMap<String, Namespace>>,
    disk: Option<Arc<DiskTier>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Memory,
    Persistent,
}

/// Shared two-tier cache. Cloning is cheap and every clone sees the same data.
#[derive(Debug, Clone)]
pub struct CacheStore {
    inner: Arc<CacheInner>,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_notifier(config, Notifier::default())
    }

    /// Builds a store that reports persistence degradation through `notifier`.
    pub fn with_notifier(config: CacheConfig, notifier: Notifier) -> Self {
        let disk = config
            .root_dir
            .clone()
            .map(|root| Arc::new(DiskTier::new(root, notifier)));

        Self {
            inner: Arc::new(CacheInner {
                config,
                namespaces: Mutex::new(HashMap::new()),
                disk,
            }),
        }
    }

    pub fn memory_only() -> Self {
        Self::new(CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn root_dir(&self) -> Option<&Path> {
        self.inner.disk.as_deref().map(DiskTier::root)
    }

    /// Whether writes to `namespace` currently reach the persistent tier.
    pub fn is_persistent(&self, namespace: &str) -> bool {
        self.inner
            .disk
            .as_ref()
            .is_some_and(|disk| !disk.is_degraded(namespace))
    }

    /// Strict read: the value only while its age is within its TTL.
    pub async fn get(&self, namespace: &str, key: &str) -> Option<CacheHit> {
        if validate_namespace(namespace).is_err() {
            return None;
        }
        let now = UtcDateTime::now();
        let found = self.lookup(namespace, key).await;

        let mut namespaces = self.namespaces();
        let slot = namespace_slot(&mut namespaces, namespace, self.inner.config.max_entries);
        match found {
            Some((entry, tier)) if entry.is_fresh_at(now) => {
                record_hit(&mut slot.stats, tier);
                Some(CacheHit {
                    value: entry.value.clone(),
                    age: entry.age_at(now),
                })
            }
            _ => {
                slot.stats.record_miss();
                None
            }
        }
    }

    /// Stale-tolerant read: the value while its age is within `ceiling`, flagged
    /// `is_stale` once it is past its TTL.
    pub async fn get_with_stale(
        &self,
        namespace: &str,
        key: &str,
        ceiling: StaleCeiling,
    ) -> Option<StaleRead> {
        if validate_namespace(namespace).is_err() {
            return None;
        }
        let now = UtcDateTime::now();
        let found = self.lookup(namespace, key).await;

        let mut namespaces = self.namespaces();
        let slot = namespace_slot(&mut namespaces, namespace, self.inner.config.max_entries);
        match found {
            Some((entry, tier)) if ceiling.allows(entry.age_at(now)) => {
                record_hit(&mut slot.stats, tier);
                Some(StaleRead {
                    value: entry.value.clone(),
                    age: entry.age_at(now),
                    is_stale: !entry.is_fresh_at(now),
                })
            }
            _ => {
                slot.stats.record_miss();
                None
            }
        }
    }

    /// Stores `value` under `key`. `ttl` falls back to the configured default.
    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), ValidationError> {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
        self.set_entry(namespace, CacheEntry::new(key, value, ttl))
            .await
    }

    /// Stores a fully built entry, replacing any previous entry for its key.
    pub async fn set_entry(&self, namespace: &str, entry: CacheEntry) -> Result<(), ValidationError> {
        validate_namespace(namespace)?;
        if entry.key.is_empty() {
            return Err(ValidationError::EmptyCacheKey);
        }

        {
            let mut namespaces = self.namespaces();
            let slot = namespace_slot(&mut namespaces, namespace, self.inner.config.max_entries);
            if let Some(evicted) = slot.memory.insert(entry.clone()) {
                slot.stats.record_eviction();
                tracing::debug!(namespace, key = %evicted, "evicted least recently used entry");
            }
            slot.stats.record_write();
        }

        if let Some(disk) = &self.inner.disk {
            disk.schedule_write(namespace, entry);
        }
        Ok(())
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), ValidationError> {
        validate_namespace(namespace)?;
        if let Some(slot) = self.namespaces().get_mut(namespace) {
            slot.memory.remove(key);
        }
        if let Some(disk) = &self.inner.disk {
            disk.remove(namespace, key).await;
        }
        Ok(())
    }

    /// Removes every entry of `namespace` from both tiers. Counters are kept.
    pub async fn clear(&self, namespace: &str) -> Result<(), ValidationError> {
        validate_namespace(namespace)?;
        if let Some(slot) = self.namespaces().get_mut(namespace) {
            slot.memory.clear();
        }
        if let Some(disk) = &self.inner.disk {
            disk.clear(namespace).await;
        }
        tracing::info!(namespace, "cache namespace cleared");
        Ok(())
    }

    /// Counters for `namespace`; all zero when it has never been used.
    pub fn stats(&self, namespace: &str) -> CacheStats {
        let namespaces = self.namespaces();
        namespaces
            .get(namespace)
            .map(|slot| CacheStats {
                entries: slot.memory.len(),
                ..slot.stats
            })
            .unwrap_or_default()
    }

    /// Every namespace touched since startup, sorted, with its counters.
    pub fn all_stats(&self) -> BTreeMap<String, CacheStats> {
        let namespaces = self.namespaces();
        namespaces
            .iter()
            .map(|(name, slot)| {
                (
                    name.clone(),
                    CacheStats {
                        entries: slot.memory.len(),
                        ..slot.stats
                    },
                )
            })
            .collect()
    }

    /// Waits for every background persistent write issued so far.
    pub async fn flush(&self) {
        if let Some(disk) = &self.inner.disk {
            disk.flush().await;
        }
    }

    /// Drops entries older than `ceiling` from memory and disk, plus unreadable files.
    pub async fn sweep(&self, ceiling: StaleCeiling) -> SweepReport {
        let now = UtcDateTime::now();
        let max_age = ceiling.as_duration();

        let memory_removed = match max_age {
            Some(max_age) => self
                .namespaces()
                .values_mut()
                .map(|slot| slot.memory.remove_older_than(max_age, now))
                .sum(),
            None => 0,
        };

        let files_removed = match &self.inner.disk {
            Some(disk) => disk.sweep(max_age, now).await,
            None => 0,
        };

        if memory_removed + files_removed > 0 {
            tracing::debug!(memory_removed, files_removed, "cache sweep finished");
        }
        SweepReport {
            memory_removed,
            files_removed,
        }
    }

    /// Memory first, then the persistent tier. A disk hit is promoted into
    /// memory unless a write for the key landed while the file was read.
    async fn lookup(&self, namespace: &str, key: &str) -> Option<(Arc<CacheEntry>, Tier)> {
        if key.is_empty() {
            return None;
        }

        {
            let mut namespaces = self.namespaces();
            let slot = namespace_slot(&mut namespaces, namespace, self.inner.config.max_entries);
            if let Some(entry) = slot.memory.get(key) {
                return Some((entry, Tier::Memory));
            }
        }

        let disk = self.inner.disk.as_ref()?;
        if disk.is_degraded(namespace) {
            return None;
        }
        let entry = disk.read(namespace, key).await?;

        let mut namespaces = self.namespaces();
        let slot = namespace_slot(&mut namespaces, namespace, self.inner.config.max_entries);
        if let Some(current) = slot.memory.get(key) {
            return Some((current, Tier::Memory));
        }
        if let Some(evicted) = slot.memory.insert(entry.clone()) {
            slot.stats.record_eviction();
            tracing::debug!(namespace, key = %evicted, "evicted least recently used entry");
        }
        Some((Arc::new(entry), Tier::Persistent))
    }

    fn namespaces(&self) -> MutexGuard<'_, HashMap<String, Namespace>> {
        self.inner
            .namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn namespace_slot<'a>(
    namespaces: &'a mut HashMap<String, Namespace>,
    namespace: &str,
    max_entries: usize,
) -> &'a mut Namespace {
    namespaces
        .entry(namespace.to_owned())
        .or_insert_with(|| Namespace {
            memory: MemoryTier::new(max_entries),
            stats: CacheStats::default(),
        })
}

fn record_hit(stats: &mut CacheStats, tier: Tier) {
    match tier {
        Tier::Memory => stats.record_memory_hit(),
        Tier::Persistent => stats.record_persistent_hit(),
    }
}

/// Namespaces double as directory names, so they must be a single path component.
pub fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    let invalid = namespace.is_empty()
        || namespace == "."
        || namespace == ".."
        || namespace.contains(['/', '\\', '\0']);
    if invalid {
        return Err(ValidationError::InvalidNamespace {
            value: namespace.to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_ceiling_accepts_seconds_or_unlimited() {
        let within: StaleCeiling = serde_json::from_str("3600").expect("seconds");
        assert_eq!(within, StaleCeiling::Within(Duration::from_secs(3600)));

        let unlimited: StaleCeiling = serde_json::from_str("\"unlimited\"").expect("keyword");
        assert_eq!(unlimited, StaleCeiling::Unlimited);
        assert!(unlimited.allows(Duration::from_secs(u64::MAX / 2)));

        assert!(serde_json::from_str::<StaleCeiling>("\"forever\"").is_err());
        assert_eq!(
            serde_json::to_value(StaleCeiling::Unlimited).expect("serializes"),
            Value::from("unlimited")
        );
    }

    #[test]
    fn default_stale_ceiling_is_two_days() {
        let ceiling = StaleCeiling::default();
        assert!(ceiling.allows(Duration::from_secs(48 * 3600)));
        assert!(!ceiling.allows(Duration::from_secs(48 * 3600 + 1)));
    }

    #[test]
    fn namespaces_must_be_single_path_components() {
        assert!(validate_namespace("metar").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(validate_namespace(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn memory_only_store_round_trips_and_counts() {
        let cache = CacheStore::memory_only();

        assert!(cache.get("metar", "kjfk").await.is_none());
        cache
            .set("metar", "kjfk", Value::from("METAR KJFK"), None)
            .await
            .expect("valid write");

        let hit = cache.get("metar", "kjfk").await.expect("fresh hit");
        assert_eq!(hit.value, Value::from("METAR KJFK"));

        let stats = cache.stats("metar");
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn expired_entry_is_stale_but_not_fresh() {
        let cache = CacheStore::memory_only();
        let mut entry = CacheEntry::new("kjfk", Value::from(1), Duration::from_secs(60));
        entry.created_at = UtcDateTime::now()
            .checked_minus(Duration::from_secs(120))
            .expect("in range");
        cache.set_entry("metar", entry).await.expect("valid write");

        assert!(cache.get("metar", "kjfk").await.is_none());

        let stale = cache
            .get_with_stale("metar", "kjfk", StaleCeiling::Within(Duration::from_secs(600)))
            .await
            .expect("within ceiling");
        assert!(stale.is_stale);

        assert!(cache
            .get_with_stale("metar", "kjfk", StaleCeiling::Within(Duration::from_secs(30)))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_namespace_on_write() {
        let cache = CacheStore::memory_only();
        let err = cache
            .set("../escape", "k", Value::Null, None)
            .await
            .expect_err("invalid namespace");
        assert!(matches!(err, ValidationError::InvalidNamespace { .. }));
        assert!(cache.get("../escape", "k").await.is_none());
    }

    #[tokio::test]
    async fn clear_keeps_counters() {
        let cache = CacheStore::memory_only();
        cache
            .set("traffic", "abc", Value::from(1), None)
            .await
            .expect("valid write");
        cache.clear("traffic").await.expect("valid namespace");

        let stats = cache.stats("traffic");
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.writes, 1);
        assert!(cache.get("traffic", "abc").await.is_none());
    }
}
