//! Shared bucket store capability.
//!
//! The admission controller only ever talks to a [`BucketStore`]. Values are
//! opaque JSON documents so the same contract fits an in-process map, a
//! networked cache or the gossip-replicated cluster store.

mod cluster;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::Bucket;

pub use cluster::ClusterStore;
pub use memory::MemoryStore;

/// A value as held by the store.
pub type StoredValue = serde_json::Value;

/// Failures reported by a store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A store call did not complete in time
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The backend failed while serving the call
    #[error("store backend error: {0}")]
    Backend(String),
    /// The backend lacks an optional capability
    #[error("store does not support {0}")]
    Unsupported(&'static str),
}

/// Key-value store with per-entry expiry.
///
/// `get` and `set` are the whole required contract. Implementations that can
/// apply the fixed-window rules atomically advertise it through
/// [`BucketStore::supports_atomic_increment`] and override
/// [`BucketStore::increment`].
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the value stored under `key`, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;

    /// Store `value` under `key` for at most `ttl`.
    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<(), StoreError>;

    /// Whether [`BucketStore::increment`] is implemented.
    fn supports_atomic_increment(&self) -> bool {
        false
    }

    /// Atomically load the bucket under `key` (fresh if missing, expired or
    /// malformed), count one request, persist it with its remaining window as
    /// TTL and return the updated bucket.
    async fn increment(
        &self,
        key: &str,
        now: i64,
        window_secs: u64,
    ) -> Result<Bucket, StoreError> {
        let _ = (key, now, window_secs);
        Err(StoreError::Unsupported("atomic increment"))
    }
}
