//! Persistent cache tier: one JSON document per key under `<root>/<namespace>/`.
//!
//! Writes are spawned onto the runtime and serialized per key. Each write
//! carries a generation number taken when `set` was called; a write whose
//! generation is older than what already landed for that key is dropped, so
//! files always end up holding the most recently issued value. Documents are
//! written to a temp file and renamed into place, so readers never see a
//! partial document.
//!
//! Per-key state lives only while an operation on that key is queued or
//! running. Generations are issued under the same lock that registers the
//! operation, so a key whose state was dropped can only see newer writes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::fs;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::notify::{Notification, Notifier};
use crate::UtcDateTime;

const FILE_EXTENSION: &str = "json";
const MAX_ENCODED_KEY_LEN: usize = 160;

/// Generation of the last operation that landed for a key.
type LandedGeneration = Arc<tokio::sync::Mutex<u64>>;
type KeySlots = Arc<Mutex<HashMap<PathBuf, KeySlot>>>;

#[derive(Debug, Default)]
struct KeySlot {
    landed: LandedGeneration,
    holders: usize,
}

/// One queued or running operation on a key file. Dropping the last ticket
/// for a key releases its slot.
#[derive(Debug)]
struct KeyTicket {
    slots: KeySlots,
    path: PathBuf,
    generation: u64,
    landed: LandedGeneration,
}

impl Drop for KeyTicket {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        if let Some(slot) = slots.get_mut(&self.path) {
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders == 0 {
                slots.remove(&self.path);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct DiskTier {
    root: PathBuf,
    generation: AtomicU64,
    key_slots: KeySlots,
    pending: Mutex<Vec<JoinHandle<()>>>,
    ready: Mutex<HashSet<String>>,
    degraded: Mutex<HashSet<String>>,
    notifier: Notifier,
}

impl DiskTier {
    pub(crate) fn new(root: PathBuf, notifier: Notifier) -> Self {
        Self {
            root,
            generation: AtomicU64::new(0),
            key_slots: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(Vec::new()),
            ready: Mutex::new(HashSet::new()),
            degraded: Mutex::new(HashSet::new()),
            notifier,
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn is_degraded(&self, namespace: &str) -> bool {
        lock(&self.degraded).contains(namespace)
    }

    pub(crate) fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root
            .join(namespace)
            .join(format!("{}.{FILE_EXTENSION}", encode_key(key)))
    }

    /// Reads a document. Missing, unreadable and corrupt files are all misses.
    pub(crate) async fn read(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
        let path = self.path_for(namespace, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(namespace, path = %path.display(), %error, "cache file unreadable");
                return None;
            }
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key == key => Some(entry),
            Ok(entry) => {
                tracing::warn!(
                    namespace,
                    expected = key,
                    found = %entry.key,
                    "cache file holds a different key; treating as miss"
                );
                None
            }
            Err(error) => {
                tracing::warn!(
                    namespace,
                    path = %path.display(),
                    %error,
                    "cache file is corrupt; treating as miss until rewritten"
                );
                None
            }
        }
    }

    /// Queues a write of `entry` without waiting for it.
    pub(crate) fn schedule_write(self: &Arc<Self>, namespace: &str, entry: CacheEntry) {
        if self.is_degraded(namespace) {
            return;
        }

        let ticket = self.ticket(&self.path_for(namespace, &entry.key));
        let tier = Arc::clone(self);
        let namespace = namespace.to_owned();
        let handle = tokio::spawn(async move {
            tier.write(namespace, entry, ticket).await;
        });

        let mut pending = lock(&self.pending);
        pending.retain(|handle| !handle.is_finished());
        pending.push(handle);
    }

    /// Waits until every write queued so far has landed (or failed).
    pub(crate) async fn flush(&self) {
        loop {
            let handles = std::mem::take(&mut *lock(&self.pending));
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(error) = handle.await {
                    tracing::warn!(%error, "cache write task did not complete");
                }
            }
        }
    }

    pub(crate) async fn remove(&self, namespace: &str, key: &str) {
        let path = self.path_for(namespace, key);
        let ticket = self.ticket(&path);
        let mut written = ticket.landed.lock().await;
        if ticket.generation <= *written {
            return;
        }

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(namespace, path = %path.display(), %error, "failed to remove cache file");
            }
        }
        *written = ticket.generation;
    }

    pub(crate) async fn clear(&self, namespace: &str) {
        self.flush().await;
        let dir = self.root.join(namespace);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(namespace, dir = %dir.display(), %error, "failed to clear cache namespace");
            }
        }
        lock(&self.ready).remove(namespace);
    }

    /// Best-effort removal of corrupt documents and documents older than `max_age`.
    pub(crate) async fn sweep(&self, max_age: Option<Duration>, now: UtcDateTime) -> usize {
        let mut removed = 0;
        let mut namespaces = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(_) => return 0,
        };

        while let Ok(Some(namespace_dir)) = namespaces.next_entry().await {
            let Ok(mut files) = fs::read_dir(namespace_dir.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                    continue;
                }
                if self.sweep_file(&path, max_age, now).await {
                    removed += 1;
                }
            }
        }

        removed
    }

    async fn sweep_file(&self, path: &Path, max_age: Option<Duration>, now: UtcDateTime) -> bool {
        let ticket = self.ticket(path);
        let _guard = ticket.landed.lock().await;

        let expired = match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => max_age.is_some_and(|max_age| entry.age_at(now) > max_age),
                Err(_) => true,
            },
            Err(_) => false,
        };

        expired && fs::remove_file(path).await.is_ok()
    }

    async fn write(&self, namespace: String, entry: CacheEntry, ticket: KeyTicket) {
        if !self.ensure_namespace_dir(&namespace).await {
            return;
        }

        let mut written = ticket.landed.lock().await;
        if ticket.generation <= *written {
            tracing::trace!(namespace = %namespace, key = %entry.key, "superseded cache write skipped");
            return;
        }

        match write_atomically(&ticket.path, &entry).await {
            Ok(()) => {
                *written = ticket.generation;
                tracing::trace!(namespace = %namespace, key = %entry.key, "cache entry persisted");
            }
            Err(error) => {
                tracing::warn!(
                    namespace = %namespace,
                    key = %entry.key,
                    %error,
                    "persistent cache write failed; memory tier remains authoritative"
                );
            }
        }
    }

    async fn ensure_namespace_dir(&self, namespace: &str) -> bool {
        if lock(&self.ready).contains(namespace) {
            return true;
        }
        if self.is_degraded(namespace) {
            return false;
        }

        let dir = self.root.join(namespace);
        match fs::create_dir_all(&dir).await {
            Ok(()) => {
                lock(&self.ready).insert(namespace.to_owned());
                true
            }
            Err(error) => {
                let first_report = lock(&self.degraded).insert(namespace.to_owned());
                if first_report {
                    tracing::warn!(
                        namespace,
                        dir = %dir.display(),
                        %error,
                        "cannot create cache directory; namespace degrades to memory-only"
                    );
                    self.notifier.publish(Notification::PersistenceDegraded {
                        namespace: namespace.to_owned(),
                        reason: error.to_string(),
                        at: UtcDateTime::now(),
                    });
                }
                false
            }
        }
    }

    /// Registers an operation on `path` and issues its generation.
    fn ticket(&self, path: &Path) -> KeyTicket {
        let mut slots = lock(&self.key_slots);
        let slot = slots.entry(path.to_path_buf()).or_default();
        slot.holders += 1;
        KeyTicket {
            slots: Arc::clone(&self.key_slots),
            path: path.to_path_buf(),
            generation: self.next_generation(),
            landed: Arc::clone(&slot.landed),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }
}

async fn write_atomically(path: &Path, entry: &CacheEntry) -> Result<(), std::io::Error> {
    let bytes = serde_json::to_vec(entry).map_err(std::io::Error::other)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

    fs::write(&temp, &bytes).await?;
    if let Err(error) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(error);
    }
    Ok(())
}

/// File-system safe, stable encoding of a cache key.
fn encode_key(key: &str) -> String {
    let encoded = urlencoding::encode(key).into_owned();
    if encoded.len() <= MAX_ENCODED_KEY_LEN && !encoded.starts_with('.') {
        return encoded;
    }

    let mut prefix: String = encoded
        .trim_start_matches('.')
        .chars()
        .take(MAX_ENCODED_KEY_LEN - 17)
        .collect();
    prefix.push('-');
    prefix.push_str(&format!("{:016x}", fnv1a(key.as_bytes())));
    prefix
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
