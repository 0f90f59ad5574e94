//! Admission service request handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::middleware::{RateLimitMiddleware, RateLimitResponse};
use crate::ratelimit::{RequestIdentity, STATUS_TOO_MANY_REQUESTS};

/// One admission query, as sent by a proxy or gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Authenticated subject id
    #[serde(default)]
    pub subject: Option<String>,
    /// Client network address
    #[serde(default)]
    pub address: Option<String>,
}

impl From<AdmissionRequest> for RequestIdentity {
    fn from(request: AdmissionRequest) -> Self {
        RequestIdentity {
            subject: request.subject,
            address: request.address,
        }
    }
}

/// The answer to an admission query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionReply {
    pub allowed: bool,
    /// Status the proxy should answer with if it rejects
    pub status: u16,
    /// Headers to attach to the proxied response
    pub headers: BTreeMap<String, String>,
}

impl AdmissionReply {
    fn allowed() -> Self {
        Self {
            allowed: true,
            status: 200,
            headers: BTreeMap::new(),
        }
    }
}

impl RateLimitResponse for AdmissionReply {
    fn too_many_requests() -> Self {
        Self {
            allowed: false,
            status: STATUS_TOO_MANY_REQUESTS,
            headers: BTreeMap::new(),
        }
    }

    fn set_header(&mut self, name: &'static str, value: String) {
        self.headers.insert(name.to_string(), value);
    }
}

/// Serves admission queries through a [`RateLimitMiddleware`].
pub struct AdmissionService {
    middleware: Arc<RateLimitMiddleware>,
}

impl AdmissionService {
    pub fn new(middleware: Arc<RateLimitMiddleware>) -> Self {
        Self { middleware }
    }

    /// Answer one request line with one reply line (without the newline).
    #[instrument(skip(self, line))]
    pub async fn handle_line(&self, line: &str) -> String {
        let request: AdmissionRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Received malformed admission request");
                return error_line(format!("invalid request: {}", e));
            }
        };

        debug!(
            subject = ?request.subject,
            address = ?request.address,
            "Processing admission request"
        );

        let identity = RequestIdentity::from(request);
        match self
            .middleware
            .process(&identity, || async { AdmissionReply::allowed() })
            .await
        {
            Ok(reply) => serde_json::to_string(&reply)
                .unwrap_or_else(|e| error_line(format!("failed to encode reply: {}", e))),
            Err(e) => error_line(e.to_string()),
        }
    }
}

pub(super) fn error_line(error: String) -> String {
    serde_json::json!({ "error": error }).to_string()
}
