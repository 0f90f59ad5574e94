//! Bucket store replicated over the chitchat mesh.
//!
//! Every node writes into its own node state and reads the freshest live
//! entry any node published. Last writer wins; two nodes writing the same
//! key within one gossip round can each lose the other's increment. This
//! backend therefore never offers atomic increments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{BucketStore, StoreError, StoredValue};
use crate::mesh::Cluster;

/// Namespace for store entries inside chitchat node state.
const KEY_PREFIX: &str = "kv|";

/// What is actually gossiped for each key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    value: StoredValue,
    expires_at_ms: i64,
    written_at_ms: i64,
}

/// A [`BucketStore`] backed by the cluster's replicated node state.
pub struct ClusterStore {
    cluster: Arc<Cluster>,
    /// Keys this node has published, with their expiry in unix millis.
    published: Mutex<HashMap<String, i64>>,
}

impl ClusterStore {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            published: Mutex::new(HashMap::new()),
        }
    }

    fn chitchat_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// Forget published keys whose TTL has passed, returning their chitchat keys.
    fn take_expired(&self, now_ms: i64) -> Vec<String> {
        let mut published = self.published.lock();
        let expired: Vec<String> = published
            .iter()
            .filter(|(_, expires_at_ms)| **expires_at_ms <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            published.remove(key);
        }
        expired
    }

    /// Stop gossiping this node's entries whose TTL has passed.
    ///
    /// Returns how many entries were retracted.
    pub async fn retract_expired(&self) -> usize {
        self.retract_expired_at(Utc::now().timestamp_millis()).await
    }

    async fn retract_expired_at(&self, now_ms: i64) -> usize {
        let expired = self.take_expired(now_ms);
        if !expired.is_empty() {
            trace!(count = expired.len(), "Retracting expired entries");
            self.cluster.delete_local(&expired).await;
        }
        expired.len()
    }

    /// Periodically retract expired entries until the returned task is aborted.
    ///
    /// Without it, a node that stops writing keeps gossiping its last entries.
    pub fn spawn_reaper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let retracted = self.retract_expired().await;
                if retracted > 0 {
                    debug!(
                        retracted,
                        published = self.published_len(),
                        "Retracted expired replicated entries"
                    );
                }
            }
        })
    }

    /// Number of entries this node currently publishes.
    pub fn published_len(&self) -> usize {
        self.published.lock().len()
    }
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore")
            .field("cluster", &self.cluster)
            .field("published", &self.published.lock().len())
            .finish()
    }
}

#[async_trait]
impl BucketStore for ClusterStore {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let chitchat_key = Self::chitchat_key(key);
        let now_ms = Utc::now().timestamp_millis();

        let freshest = self
            .cluster
            .values(&chitchat_key)
            .await
            .into_iter()
            .filter_map(|raw| match serde_json::from_str::<Envelope>(&raw) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(key = %key, error = %e, "Ignoring undecodable replicated entry");
                    None
                }
            })
            .filter(|envelope| envelope.expires_at_ms > now_ms)
            .max_by_key(|envelope| envelope.written_at_ms);

        Ok(freshest.map(|envelope| envelope.value))
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<(), StoreError> {
        let chitchat_key = Self::chitchat_key(key);
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at_ms = now_ms.saturating_add(ttl_ms);

        let envelope = Envelope {
            value,
            expires_at_ms,
            written_at_ms: now_ms,
        };
        let raw = serde_json::to_string(&envelope)
            .map_err(|e| StoreError::Backend(format!("failed to encode entry: {}", e)))?;

        self.cluster.set_local(&chitchat_key, raw).await;
        self.published.lock().insert(chitchat_key, expires_at_ms);
        self.retract_expired_at(now_ms).await;

        Ok(())
    }
}
