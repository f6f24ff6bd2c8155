use serde::{Deserialize, Serialize};

/// Per-namespace cache counters. Counters only grow for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    /// Entries currently held in the memory tier.
    pub entries: usize,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.persistent_hits
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits() + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits() as f64 / lookups as f64
    }

    pub(crate) fn record_memory_hit(&mut self) {
        self.memory_hits += 1;
    }

    pub(crate) fn record_persistent_hit(&mut self) {
        self.persistent_hits += 1;
    }

    pub(crate) fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub(crate) fn record_write(&mut self) {
        self.writes += 1;
    }

    pub(crate) fn record_eviction(&mut self) {
        self.evictions += 1;
    }
}
