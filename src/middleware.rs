//! Rate-limiting middleware over an [`AdmissionController`].
//!
//! The HTTP stack is abstracted behind [`RateLimitResponse`]; the downstream
//! handler is any async closure producing that response type.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::ratelimit::{AdmissionController, Decision, RequestIdentity};
use crate::store::StoreError;

/// A response the middleware can produce or annotate.
pub trait RateLimitResponse: Sized {
    /// An empty `429 Too Many Requests` response.
    fn too_many_requests() -> Self;

    /// Set a header, replacing any previous value.
    fn set_header(&mut self, name: &'static str, value: String);
}

/// How to react when the store cannot be consulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Return the store error to the caller
    #[default]
    Propagate,
    /// Forward the request downstream without quota headers
    FailOpen,
    /// Reject the request with a bare 429
    FailClosed,
}

/// Applies admission decisions to a request/response exchange.
pub struct RateLimitMiddleware {
    controller: Arc<AdmissionController>,
    on_store_failure: StoreFailurePolicy,
}

impl RateLimitMiddleware {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self {
            controller,
            on_store_failure: StoreFailurePolicy::default(),
        }
    }

    pub fn with_store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.on_store_failure = policy;
        self
    }

    /// Gate a request at the current time.
    pub async fn process<R, F, Fut>(
        &self,
        identity: &RequestIdentity,
        next: F,
    ) -> Result<R, StoreError>
    where
        R: RateLimitResponse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.process_at(identity, Utc::now().timestamp(), next).await
    }

    /// Gate a request at `now`.
    ///
    /// Admitted requests run `next` and get the quota headers on its response;
    /// denied requests get a 429 carrying the same headers plus `Retry-After`.
    #[instrument(skip(self, next), fields(key = %identity.key()))]
    pub async fn process_at<R, F, Fut>(
        &self,
        identity: &RequestIdentity,
        now: i64,
        next: F,
    ) -> Result<R, StoreError>
    where
        R: RateLimitResponse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let decision = match self.controller.evaluate(identity, now).await {
            Ok(decision) => decision,
            Err(e) => return self.on_failure(e, next).await,
        };

        let mut response = if decision.is_admitted() {
            next().await
        } else {
            R::too_many_requests()
        };
        apply_headers(&mut response, &decision);

        Ok(response)
    }

    async fn on_failure<R, F, Fut>(&self, error: StoreError, next: F) -> Result<R, StoreError>
    where
        R: RateLimitResponse,
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        match self.on_store_failure {
            StoreFailurePolicy::Propagate => Err(error),
            StoreFailurePolicy::FailOpen => {
                warn!(error = %error, "Store failure, admitting request");
                Ok(next().await)
            }
            StoreFailurePolicy::FailClosed => {
                warn!(error = %error, "Store failure, rejecting request");
                Ok(R::too_many_requests())
            }
        }
    }
}

/// Copy a decision's quota headers onto a response.
pub fn apply_headers<R: RateLimitResponse>(response: &mut R, decision: &Decision) {
    for (name, value) in decision.headers() {
        response.set_header(name, value);
    }
}
