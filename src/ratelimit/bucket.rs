//! Fixed-window bucket record.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::store::StoredValue;

/// One identity's usage within the current window.
///
/// Stored as `{"count": <u64>, "reset": <unix seconds>}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Requests counted in the current window, rejected ones included
    pub count: u64,
    /// Unix timestamp (seconds) at which the window ends
    #[serde(rename = "reset")]
    pub reset_at: i64,
}

impl Bucket {
    /// An empty bucket whose window starts at `now`.
    pub fn fresh(now: i64, window_secs: u64) -> Self {
        Self {
            count: 0,
            reset_at: now.saturating_add(window_secs as i64),
        }
    }

    /// Whether the window has ended. A bucket expiring exactly at `now` is expired.
    pub fn is_expired(&self, now: i64) -> bool {
        self.reset_at <= now
    }

    /// The bucket a request at `now` should count against.
    ///
    /// Missing or expired buckets are replaced by a fresh one; stale state
    /// is never carried into a new window.
    pub fn current_or_fresh(stored: Option<Bucket>, now: i64, window_secs: u64) -> Self {
        match stored {
            Some(bucket) if !bucket.is_expired(now) => bucket,
            _ => Self::fresh(now, window_secs),
        }
    }

    /// Count one request.
    pub fn hit(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Seconds left in the window, zero once expired.
    pub fn seconds_until_reset(&self, now: i64) -> u64 {
        self.reset_at.saturating_sub(now).max(0) as u64
    }

    /// How long the store should keep this bucket, never more than one window.
    pub fn ttl(&self, now: i64, window_secs: u64) -> Duration {
        Duration::from_secs(self.seconds_until_reset(now).min(window_secs))
    }

    /// Encode for the shared store.
    pub fn to_value(&self) -> StoredValue {
        json!({ "count": self.count, "reset": self.reset_at })
    }

    /// Decode a stored value, returning `None` when it has the wrong shape.
    pub fn from_value(value: &StoredValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
