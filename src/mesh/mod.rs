//! Peer mesh networking using Chitchat.
//!
//! Gossip-based cluster membership and state dissemination backing the
//! replicated bucket store.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError};
