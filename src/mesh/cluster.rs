//! Cluster management using Chitchat.
//!
//! Each node publishes the entries it writes in its own chitchat node state;
//! gossip replicates them so every node can read every other node's writes.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "turnstile".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// The cluster handle for replicated state.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Publish a value under `key` in this node's state.
    pub async fn set_local(&self, key: &str, value: String) {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().set(key, value);

        debug!(key = %key, "Published local value");
    }

    /// Remove keys from this node's state.
    pub async fn delete_local(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let state = chitchat.self_node_state();
        for key in keys {
            state.delete(key);
        }

        debug!(deleted = keys.len(), "Deleted local values");
    }

    /// Collect the values every live node holds for `key`.
    pub async fn values(&self, key: &str) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;

        chitchat
            .live_nodes()
            .filter_map(|node_id| chitchat.node_state(node_id))
            .filter_map(|node_state| node_state.get(key).map(|value| value.to_string()))
            .collect()
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(port: u16) -> ClusterConfig {
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_cluster_start() {
        let cluster = Cluster::start(test_config(17946)).await.unwrap();

        assert_eq!(cluster.node_id(), "test-node-17946");
        assert_eq!(cluster.live_node_count().await, 1); // Just ourselves
        assert_eq!(cluster.live_nodes().await, vec!["test-node-17946".to_string()]);

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_values() {
        let cluster = Cluster::start(test_config(17947)).await.unwrap();

        assert!(cluster.values("kv|a").await.is_empty());

        cluster.set_local("kv|a", "one".to_string()).await;
        assert_eq!(cluster.values("kv|a").await, vec!["one".to_string()]);

        cluster.set_local("kv|a", "two".to_string()).await;
        assert_eq!(cluster.values("kv|a").await, vec!["two".to_string()]);

        cluster.delete_local(&["kv|a".to_string()]).await;
        assert!(cluster.values("kv|a").await.is_empty());

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_values_replicate_between_nodes() {
        let cluster1 = Cluster::start(test_config(17948)).await.unwrap();

        let mut config2 = test_config(17949);
        config2.seed_nodes = vec!["127.0.0.1:17948".to_string()];
        let cluster2 = Cluster::start(config2).await.unwrap();

        // Give them time to discover each other
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(cluster1.live_node_count().await, 2);
        assert_eq!(cluster2.live_node_count().await, 2);

        cluster1.set_local("kv|shared", "from-1".to_string()).await;

        // Give time for gossip
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cluster2.values("kv|shared").await, vec!["from-1".to_string()]);

        cluster2.set_local("kv|shared", "from-2".to_string()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut seen = cluster1.values("kv|shared").await;
        seen.sort();
        assert_eq!(seen, vec!["from-1".to_string(), "from-2".to_string()]);

        cluster1.shutdown().await.unwrap();
        cluster2.shutdown().await.unwrap();
    }
}
