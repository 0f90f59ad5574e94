//! Turnstile - Fixed-Window Request Admission Control
//!
//! This crate gates inbound requests with a keyed fixed-window counter kept
//! in a shared store. The store is a narrow get/set-with-TTL capability, so
//! the same controller runs against an in-process map or a gossip-replicated
//! cluster store.

pub mod config;
pub mod error;
pub mod mesh;
pub mod middleware;
pub mod ratelimit;
pub mod server;
pub mod store;
