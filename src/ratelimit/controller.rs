//! Fixed-window admission controller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, trace, warn};

use super::bucket::Bucket;
use super::decision::Decision;
use super::identity::{IdentityKey, RequestIdentity};
use super::policy::RateLimitPolicy;
use crate::store::{BucketStore, StoreError, StoredValue};

/// Gates requests against a per-identity fixed-window counter kept in a
/// shared store.
///
/// The controller holds no bucket state of its own. By default each
/// evaluation is one `get` and one `set`; concurrent requests for the same
/// key may interleave and lose increments. Enable
/// [`AdmissionController::with_atomic_increment`] on stores that can apply
/// the window rules in a single call.
pub struct AdmissionController {
    store: Arc<dyn BucketStore>,
    policy: RateLimitPolicy,
    atomic_increment: bool,
    store_timeout: Option<Duration>,
}

impl AdmissionController {
    /// Create a controller using read-increment-write against `store`.
    pub fn new(store: Arc<dyn BucketStore>, policy: RateLimitPolicy) -> Self {
        Self {
            store,
            policy,
            atomic_increment: false,
            store_timeout: None,
        }
    }

    /// Use the store's atomic increment when it offers one.
    ///
    /// Stores without the capability keep using `get` + `set`.
    pub fn with_atomic_increment(mut self, enabled: bool) -> Self {
        if enabled && !self.store.supports_atomic_increment() {
            warn!("Store has no atomic increment, falling back to read-modify-write");
            self.atomic_increment = false;
        } else {
            self.atomic_increment = enabled;
        }
        self
    }

    /// Bound every store call; an elapsed call fails with [`StoreError::Timeout`].
    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Whether evaluations go through the store's atomic increment.
    pub fn uses_atomic_increment(&self) -> bool {
        self.atomic_increment
    }

    /// Evaluate a request at the current wall-clock time.
    pub async fn check(&self, identity: &RequestIdentity) -> Result<Decision, StoreError> {
        self.evaluate(identity, Utc::now().timestamp()).await
    }

    /// Count the request against its identity's bucket and decide.
    ///
    /// The request is counted before the limit check, so a denied request
    /// still uses up a slot in the window.
    pub async fn evaluate(
        &self,
        identity: &RequestIdentity,
        now: i64,
    ) -> Result<Decision, StoreError> {
        let key = identity.key();
        let storage_key = key.storage_key();
        let window_secs = self.policy.window_secs();

        let bucket = if self.atomic_increment {
            self.bounded(self.store.increment(&storage_key, now, window_secs))
                .await?
        } else {
            let stored = self.bounded(self.store.get(&storage_key)).await?;
            let mut bucket = self.current_bucket(&key, stored, now);
            bucket.hit();
            self.bounded(
                self.store
                    .set(&storage_key, bucket.to_value(), bucket.ttl(now, window_secs)),
            )
            .await?;
            bucket
        };

        trace!(
            key = %key,
            count = bucket.count,
            reset = bucket.reset_at,
            "Evaluated request"
        );

        let decision = Decision::from_bucket(&bucket, &self.policy, now);
        if !decision.is_admitted() {
            debug!(
                key = %key,
                count = bucket.count,
                limit = self.policy.max_requests(),
                retry_after = ?decision.retry_after,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Decode what the store returned and apply the rollover rule.
    fn current_bucket(&self, key: &IdentityKey, stored: Option<StoredValue>, now: i64) -> Bucket {
        let decoded = stored.and_then(|value| {
            let bucket = Bucket::from_value(&value);
            if bucket.is_none() {
                warn!(key = %key, value = %value, "Malformed bucket in store, starting fresh");
            }
            bucket
        });

        if let Some(bucket) = decoded.filter(|b| b.is_expired(now)) {
            debug!(
                key = %key,
                expired_at = bucket.reset_at,
                "Window elapsed, starting a new one"
            );
        }

        Bucket::current_or_fresh(decoded, now, self.policy.window_secs())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let result = match self.store_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(limit)),
            },
            None => call.await,
        };

        if let Err(ref e) = result {
            warn!(error = %e, "Store call failed");
        }
        result
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("policy", &self.policy)
            .field("atomic_increment", &self.atomic_increment)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Outcome;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every call and can be told to fail.
    #[derive(Default)]
    struct ScriptedStore {
        value: Mutex<Option<StoredValue>>,
        last_ttl: Mutex<Option<Duration>>,
        gets: AtomicUsize,
        sets: AtomicUsize,
        fail_get: Option<StoreError>,
        fail_set: Option<StoreError>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl BucketStore for ScriptedStore {
        async fn get(&self, _key: &str) -> Result<Option<StoredValue>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(ref e) = self.fail_get {
                return Err(e.clone());
            }
            Ok(self.value.lock().clone())
        }

        async fn set(&self, _key: &str, value: StoredValue, ttl: Duration) -> Result<(), StoreError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if let Some(ref e) = self.fail_set {
                return Err(e.clone());
            }
            *self.value.lock() = Some(value);
            *self.last_ttl.lock() = Some(ttl);
            Ok(())
        }
    }

    fn memory_controller(max_requests: i64, window_secs: i64) -> (Arc<MemoryStore>, AdmissionController) {
        let store = Arc::new(MemoryStore::new());
        let controller =
            AdmissionController::new(store.clone(), RateLimitPolicy::new(max_requests, window_secs));
        (store, controller)
    }

    #[tokio::test]
    async fn test_remaining_decreases_to_zero() {
        let (_, controller) = memory_controller(5, 60);
        let identity = RequestIdentity::anonymous("10.0.0.1");

        for expected in (0..5).rev() {
            let decision = controller.evaluate(&identity, 100).await.unwrap();
            assert!(decision.is_admitted());
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.limit, 5);
            assert_eq!(decision.reset, 160);
        }
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let (store, controller) = memory_controller(3, 60);
        let identity = RequestIdentity::anonymous("9.9.9.9");

        let decisions: Vec<Decision> = {
            let mut out = Vec::new();
            for now in 0..4 {
                out.push(controller.evaluate(&identity, now).await.unwrap());
            }
            out
        };

        let remaining: Vec<u64> = decisions.iter().map(|d| d.remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0, 0]);
        assert!(decisions[..3].iter().all(Decision::is_admitted));
        assert_eq!(decisions[3].outcome, Outcome::Denied);
        assert_eq!(decisions[3].retry_after, Some(57));
        assert_eq!(decisions[3].reset, 60);

        // The denied request still counted.
        let stored = store.get("rate_ip_9.9.9.9").await.unwrap().unwrap();
        assert_eq!(Bucket::from_value(&stored).unwrap().count, 4);

        // Window over: the fifth request starts fresh.
        let decision = controller.evaluate(&identity, 61).await.unwrap();
        assert!(decision.is_admitted());
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset, 121);
    }

    #[tokio::test]
    async fn test_request_exactly_at_reset_starts_new_window() {
        let (store, controller) = memory_controller(2, 10);
        let identity = RequestIdentity::authenticated("alice");

        controller.evaluate(&identity, 0).await.unwrap();
        controller.evaluate(&identity, 5).await.unwrap();
        let denied = controller.evaluate(&identity, 9).await.unwrap();
        assert!(!denied.is_admitted());
        assert_eq!(denied.retry_after, Some(1));

        let decision = controller.evaluate(&identity, 10).await.unwrap();
        assert!(decision.is_admitted());
        assert_eq!(decision.reset, 20);

        let stored = store.get("rate_uid_alice").await.unwrap().unwrap();
        assert_eq!(Bucket::from_value(&stored), Some(Bucket { count: 1, reset_at: 20 }));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_interact() {
        let (_, controller) = memory_controller(2, 60);
        let noisy = RequestIdentity::anonymous("1.1.1.1");
        let quiet = RequestIdentity::anonymous("2.2.2.2");

        for now in 0..5 {
            controller.evaluate(&noisy, now).await.unwrap();
        }
        assert!(!controller.evaluate(&noisy, 5).await.unwrap().is_admitted());

        let decision = controller.evaluate(&quiet, 5).await.unwrap();
        assert!(decision.is_admitted());
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_prefixes_keep_subjects_and_addresses_apart() {
        let (_, controller) = memory_controller(1, 60);

        let first = controller
            .evaluate(&RequestIdentity::authenticated("ip_1"), 0)
            .await
            .unwrap();
        let second = controller
            .evaluate(&RequestIdentity::anonymous("1"), 0)
            .await
            .unwrap();

        assert!(first.is_admitted());
        assert!(second.is_admitted());
    }

    #[tokio::test]
    async fn test_clamped_configuration_behaves_like_minimum() {
        let (_, zero) = memory_controller(0, -5);
        let (_, one) = memory_controller(1, 1);
        let identity = RequestIdentity::anonymous("3.3.3.3");

        for now in [0, 0, 1, 1, 2] {
            assert_eq!(
                zero.evaluate(&identity, now).await.unwrap(),
                one.evaluate(&identity, now).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_one_get_and_one_set_per_request() {
        let store = Arc::new(ScriptedStore::default());
        let controller = AdmissionController::new(store.clone(), RateLimitPolicy::new(3, 60));

        controller
            .evaluate(&RequestIdentity::anonymous("4.4.4.4"), 3)
            .await
            .unwrap();

        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
        assert_eq!(*store.last_ttl.lock(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_ttl_is_time_left_in_window() {
        let store = Arc::new(ScriptedStore::default());
        *store.value.lock() = Some(json!({ "count": 1, "reset": 60 }));
        let controller = AdmissionController::new(store.clone(), RateLimitPolicy::new(3, 60));

        controller
            .evaluate(&RequestIdentity::anonymous("4.4.4.4"), 45)
            .await
            .unwrap();
        assert_eq!(*store.last_ttl.lock(), Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_far_future_reset_is_survivable() {
        let (store, controller) = memory_controller(3, 60);
        let identity = RequestIdentity::anonymous("6.6.6.6");
        store
            .set(
                &identity.key().storage_key(),
                json!({ "count": 1, "reset": i64::MAX }),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let decision = controller.evaluate(&identity, 0).await.unwrap();
        assert!(decision.is_admitted());
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset, i64::MAX);

        // The store never keeps it past one window.
        let scripted = Arc::new(ScriptedStore::default());
        *scripted.value.lock() = Some(json!({ "count": 1, "reset": i64::MAX }));
        let controller = AdmissionController::new(scripted.clone(), RateLimitPolicy::new(3, 60));
        controller.evaluate(&identity, 0).await.unwrap();
        assert_eq!(*scripted.last_ttl.lock(), Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_malformed_bucket_replaced() {
        let store = Arc::new(ScriptedStore::default());
        *store.value.lock() = Some(json!({ "count": "lots", "reset": null }));
        let controller = AdmissionController::new(store.clone(), RateLimitPolicy::new(3, 60));

        let decision = controller
            .evaluate(&RequestIdentity::anonymous("5.5.5.5"), 10)
            .await
            .unwrap();

        assert!(decision.is_admitted());
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset, 70);
        assert_eq!(
            store.value.lock().clone(),
            Some(json!({ "count": 1, "reset": 70 }))
        );
    }

    #[tokio::test]
    async fn test_store_failures_surface() {
        let unavailable = StoreError::Unavailable("connection refused".to_string());
        let store = Arc::new(ScriptedStore {
            fail_get: Some(unavailable.clone()),
            ..Default::default()
        });
        let controller = AdmissionController::new(store.clone(), RateLimitPolicy::new(3, 60));

        let result = controller.evaluate(&RequestIdentity::anonymous("6.6.6.6"), 0).await;
        assert_eq!(result, Err(unavailable));
        assert_eq!(store.sets.load(Ordering::SeqCst), 0);

        let backend = StoreError::Backend("read-only replica".to_string());
        let store = Arc::new(ScriptedStore {
            fail_set: Some(backend.clone()),
            ..Default::default()
        });
        let controller = AdmissionController::new(store, RateLimitPolicy::new(3, 60));
        let result = controller.evaluate(&RequestIdentity::anonymous("6.6.6.6"), 0).await;
        assert_eq!(result, Err(backend));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout() {
        let store = Arc::new(ScriptedStore {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let controller = AdmissionController::new(store, RateLimitPolicy::new(3, 60))
            .with_store_timeout(Some(Duration::from_millis(100)));

        let result = controller.evaluate(&RequestIdentity::anonymous("7.7.7.7"), 0).await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(100))));
    }

    #[tokio::test]
    async fn test_atomic_mode_requires_store_support() {
        let controller = AdmissionController::new(
            Arc::new(ScriptedStore::default()),
            RateLimitPolicy::default(),
        )
        .with_atomic_increment(true);
        assert!(!controller.uses_atomic_increment());

        let (_, controller) = memory_controller(3, 60);
        assert!(controller.with_atomic_increment(true).uses_atomic_increment());
    }

    #[tokio::test]
    async fn test_atomic_mode_matches_scenario() {
        let (_, controller) = memory_controller(3, 60);
        let controller = controller.with_atomic_increment(true);
        let identity = RequestIdentity::anonymous("9.9.9.9");

        let mut remaining = Vec::new();
        for now in 0..4 {
            remaining.push(controller.evaluate(&identity, now).await.unwrap());
        }
        assert_eq!(remaining[2].remaining, 0);
        assert_eq!(remaining[3].retry_after, Some(57));

        let decision = controller.evaluate(&identity, 61).await.unwrap();
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset, 121);
    }

    #[tokio::test]
    async fn test_concurrent_requests_with_atomic_increment() {
        let (store, controller) = memory_controller(50, 60);
        let controller = Arc::new(controller.with_atomic_increment(true));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller
                        .evaluate(&RequestIdentity::anonymous("8.8.8.8"), 0)
                        .await
                        .unwrap()
                })
            })
            .collect();

        let decisions: Vec<Decision> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(decisions.iter().filter(|d| d.is_admitted()).count(), 50);
        let stored = store.get("rate_ip_8.8.8.8").await.unwrap().unwrap();
        assert_eq!(Bucket::from_value(&stored).unwrap().count, 100);
    }

    #[tokio::test]
    async fn test_concurrent_requests_without_atomic_increment_never_overcount() {
        let (store, controller) = memory_controller(1000, 60);
        let controller = Arc::new(controller);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    controller
                        .evaluate(&RequestIdentity::anonymous("8.8.4.4"), 0)
                        .await
                        .unwrap()
                })
            })
            .collect();
        futures::future::join_all(tasks).await;

        let stored = store.get("rate_ip_8.8.4.4").await.unwrap().unwrap();
        let count = Bucket::from_value(&stored).unwrap().count;
        assert!(count >= 1 && count <= 50);
    }

    #[tokio::test]
    async fn test_check_uses_wall_clock() {
        let (_, controller) = memory_controller(3, 60);
        let before = Utc::now().timestamp();
        let decision = controller.check(&RequestIdentity::anonymous("1.2.3.4")).await.unwrap();
        assert!(decision.reset >= before + 60);
        assert!(decision.reset <= Utc::now().timestamp() + 60);
    }
}
