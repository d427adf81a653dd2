//! Fleet construction and fleet-wide shutdown.

use crate::{
    config::HarnessConfig,
    content::ContentId,
    node::{BootstrapError, NodeConfig, NodeCreateError, PeerNode, ShutdownError},
    registry::BootstrapRegistry,
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time;

/// Delay between creating the last node and starting the first, so every
/// node's address record is registered before any bootstrap pass begins.
/// Tunable.
const START_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// State shared by every node of one fleet: the bootstrap registry and the
/// deterministic test identifier set. Constructed once at startup and passed
/// by reference, so several fleets can coexist in one process.
#[derive(Clone)]
pub struct FleetContext {
    pub registry: BootstrapRegistry,
    pub test_cids: Arc<Vec<ContentId>>,
}

impl FleetContext {
    pub fn new(num_test_cids: usize) -> Self {
        let test_cids = ContentId::test_set(num_test_cids);
        for cid in &test_cids {
            log::debug!("test cid: {}", cid);
        }

        Self {
            registry: BootstrapRegistry::new(),
            test_cids: Arc::new(test_cids),
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetBuildError {
    #[error("failed to create node {index}")]
    Create {
        index: usize,
        #[source]
        source: NodeCreateError,
    },
    #[error("failed to start node {index}")]
    Start {
        index: usize,
        #[source]
        source: BootstrapError,
    },
}

/// The set of peer nodes managed together by one harness process.
///
/// Cheaply cloneable; clones share the same nodes. Membership is fixed once
/// built; the control-plane server only ever dispatches over it.
#[derive(Clone)]
pub struct Fleet {
    nodes: Arc<Vec<PeerNode>>,
}

impl Fleet {
    /// Create and start `config.count` nodes.
    ///
    /// Nodes are created sequentially and each address record is appended to
    /// the registry immediately, giving later nodes a non-empty registry to
    /// bootstrap against. Any failure stops the already-created nodes and
    /// aborts the build; the harness cannot proceed with a partial fleet.
    pub async fn build(config: &HarnessConfig, ctx: &FleetContext) -> Result<Self, FleetBuildError> {
        let mut nodes = Vec::with_capacity(config.count);

        for index in 0..config.count {
            log::info!("starting node {}", index);

            let node_config = NodeConfig {
                index,
                port: config.node_port(index),
                auto_test: config.auto_test,
                prefix_length: config.prefix_length,
                key_dir: config.key_dir.clone(),
            };

            let node = match PeerNode::create(node_config, ctx).await {
                Ok(node) => node,
                Err(source) => {
                    Self::stop_all(&nodes).await;
                    return Err(FleetBuildError::Create { index, source });
                }
            };

            ctx.registry.append(node.addr_record().clone());
            nodes.push(node);
        }

        time::sleep(START_SETTLE_DELAY).await;

        for index in 0..nodes.len() {
            if let Err(source) = nodes[index].start().await {
                Self::stop_all(&nodes).await;
                return Err(FleetBuildError::Start { index, source });
            }

            log::info!("node {} started: {}", index, nodes[index].addr_record());
        }

        Ok(Self {
            nodes: Arc::new(nodes),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PeerNode> {
        self.nodes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerNode> {
        self.nodes.iter()
    }

    /// Stop every node. The first close failure is reported after all nodes
    /// have been asked to stop.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let mut result = Ok(());

        for node in self.nodes.iter() {
            if let Err(error) = node.stop().await {
                log::warn!("failed to stop node {}: {}", node.index(), error);
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }

        result
    }

    async fn stop_all(nodes: &[PeerNode]) {
        for node in nodes {
            let _ = node.stop().await;
        }
    }
}
