//! LRU-bounded memory tier for a single namespace.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::entry::CacheEntry;
use crate::UtcDateTime;

#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    last_access: u64,
}

/// Entry map plus a recency index ordered by a logical access clock.
///
/// The clock is a counter rather than `Instant` so two accesses in the same
/// instant still have a strict order.
#[derive(Debug)]
pub(crate) struct MemoryTier {
    capacity: usize,
    entries: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    clock: u64,
}

impl MemoryTier {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Returns the entry and marks it most recently used.
    pub(crate) fn get(&mut self, key: &str) -> Option<Arc<CacheEntry>> {
        let tick = self.next_tick();
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.last_access);
        slot.last_access = tick;
        self.recency.insert(tick, key.to_owned());
        Some(Arc::clone(&slot.entry))
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces an entry. Returns the key evicted to make room, if any.
    pub(crate) fn insert(&mut self, entry: CacheEntry) -> Option<String> {
        let tick = self.next_tick();
        let key = entry.key.clone();

        if let Some(previous) = self.entries.remove(&key) {
            self.recency.remove(&previous.last_access);
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.evict_least_recent()
        } else {
            None
        };

        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                entry: Arc::new(entry),
                last_access: tick,
            },
        );

        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.recency.remove(&slot.last_access);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops entries older than `max_age`; returns how many were removed.
    pub(crate) fn remove_older_than(&mut self, max_age: Duration, now: UtcDateTime) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.age_at(now) > max_age)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_least_recent(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
