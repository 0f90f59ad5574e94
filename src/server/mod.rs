//! Admission service: answers "may this request proceed?" over TCP.
//!
//! Each request is one JSON object per line,
//! `{"subject": "42", "address": "10.0.0.1"}`, answered by one line of
//! `{"allowed": true, "status": 200, "headers": {...}}` or `{"error": "..."}`.

mod server;
mod service;

pub use server::AdmissionServer;
pub use service::{AdmissionReply, AdmissionRequest, AdmissionService};
