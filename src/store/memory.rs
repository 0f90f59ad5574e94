//! In-process bucket store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{BucketStore, StoreError, StoredValue};
use crate::ratelimit::Bucket;

/// Expiry used when `now + ttl` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

struct Entry {
    value: StoredValue,
    expires_at: Instant,
}

impl Entry {
    fn new(value: StoredValue, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now.checked_add(ttl).unwrap_or(now + FAR_FUTURE),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A sharded in-memory store with per-entry expiry.
///
/// Expired entries are invisible to readers immediately and are dropped
/// lazily on access or by [`MemoryStore::purge_expired`].
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired entries until the returned task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = self.len(), "Purged expired buckets");
                }
            }
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl BucketStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<(), StoreError> {
        trace!(key = %key, ttl_secs = ttl.as_secs(), "Storing value");
        self.entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    fn supports_atomic_increment(&self) -> bool {
        true
    }

    async fn increment(
        &self,
        key: &str,
        now: i64,
        window_secs: u64,
    ) -> Result<Bucket, StoreError> {
        // The entry guard holds the shard lock for the whole read-modify-write.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(StoredValue::Null, Duration::ZERO));

        let stored = if entry.is_live(Instant::now()) {
            Bucket::from_value(&entry.value)
        } else {
            None
        };

        let mut bucket = Bucket::current_or_fresh(stored, now, window_secs);
        bucket.hit();
        *entry = Entry::new(bucket.to_value(), bucket.ttl(now, window_secs));

        Ok(bucket)
    }
}
