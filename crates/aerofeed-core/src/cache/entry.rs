use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::duration_millis;
use crate::UtcDateTime;

/// A cached value. Entries are never mutated in place; a write replaces the whole entry.
///
/// This is also the on-disk document shape of the persistent tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: UtcDateTime,
    #[serde(rename = "ttl_ms", with = "duration_millis")]
    pub ttl: Duration,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: UtcDateTime::now(),
            ttl,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn age_at(&self, now: UtcDateTime) -> Duration {
        self.created_at.age_at(now)
    }

    /// Fresh until the age strictly exceeds the TTL.
    pub fn is_fresh_at(&self, now: UtcDateTime) -> bool {
        self.age_at(now) <= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_shape_uses_ttl_millis() {
        let entry = CacheEntry::new("KJFK", Value::from("METAR KJFK"), Duration::from_secs(90));
        let json = serde_json::to_value(&entry).expect("serializes");

        assert_eq!(json["key"], "KJFK");
        assert_eq!(json["ttl_ms"], 90_000);
        assert!(json["created_at"].as_str().is_some());

        let back: CacheEntry = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back.ttl, Duration::from_secs(90));
    }

    #[test]
    fn freshness_boundary_is_inclusive() {
        let mut entry = CacheEntry::new("k", Value::Null, Duration::from_secs(60));
        let created = UtcDateTime::parse("2024-01-01T00:00:00Z").expect("valid");
        entry.created_at = created;

        let at_ttl = UtcDateTime::parse("2024-01-01T00:01:00Z").expect("valid");
        let past_ttl = UtcDateTime::parse("2024-01-01T00:01:01Z").expect("valid");
        assert!(entry.is_fresh_at(at_ttl));
        assert!(!entry.is_fresh_at(past_ttl));
    }
}
