//! # In-process cluster
//!
//! Several [`AgoraNode`]s sharing one [`LocalNetwork`] and one genesis
//! block. Nodes are named `n0`, `n1`, ... and listen on `local://n0`, ...;
//! `n0` proposes under the fixed suffrage.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use agora_consensus::network::RemoteNode;
use agora_consensus::{FixedSuffrage, LocalNode, LocalPolicy, OperationsSource, RoundrobinSuffrage, StatesConfig, Suffrage};
use agora_core::{Address, Height, NetworkId, SystemClock};
use agora_crypto::PrivateKey;

use crate::error::{NodeError, NodeResult};
use crate::genesis::{Genesis, GenesisGenerator};
use crate::local_network::{local_conn_info, LocalNetwork};
use crate::memory::MemoryDatabase;
use crate::node::{ignore_stopped, AgoraNode, NodeParts};

/// Poll interval of [`LocalCluster::wait_height`]
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shape of a [`LocalCluster`]
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub size: usize,
    pub network_id: NetworkId,
    pub policy: LocalPolicy,
    pub states: StatesConfig,
    /// Rotate the proposer over the members instead of fixing it to `n0`
    pub roundrobin: bool,
    pub genesis_at: DateTime<Utc>,
}

impl ClusterConfig {
    pub fn new(size: usize, network_id: NetworkId) -> Self {
        let policy = LocalPolicy {
            // 2 of 3, 3 of 4
            threshold_ratio: 66.0,
            number_of_acting_suffrage_nodes: size,
            timeout_waiting_proposal_ms: 2_000,
            interval_broadcasting_init_ballot_ms: 300,
            interval_broadcasting_proposal_ms: 300,
            wait_broadcasting_accept_ballot_ms: 100,
            interval_broadcasting_accept_ballot_ms: 300,
            network_connection_timeout_ms: 1_000,
            ..LocalPolicy::default()
        }
        .with_network_id(network_id.clone());

        Self {
            size,
            network_id,
            policy,
            states: StatesConfig::default(),
            roundrobin: false,
            genesis_at: Utc::now(),
        }
    }

    pub fn with_policy(mut self, policy: LocalPolicy) -> Self {
        self.policy = policy.with_network_id(self.network_id.clone());
        self
    }

    pub fn with_states(mut self, states: StatesConfig) -> Self {
        self.states = states;
        self
    }

    pub fn with_roundrobin(mut self, roundrobin: bool) -> Self {
        self.roundrobin = roundrobin;
        self
    }
}

/// Identity of the cluster member `index`; stable across runs
pub fn member(index: usize) -> NodeResult<LocalNode> {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&(index as u64 + 1).to_be_bytes());
    Ok(LocalNode::new(
        Address::new(&format!("n{}", index))?,
        PrivateKey::from_seed(&seed),
    ))
}

/// Nodes of one network running in this process
pub struct LocalCluster {
    config: ClusterConfig,
    network: Arc<LocalNetwork>,
    members: Vec<LocalNode>,
    suffrage: Arc<dyn Suffrage>,
    genesis: Genesis,
    nodes: Vec<Arc<AgoraNode>>,
}

impl LocalCluster {
    /// Build the members, each with its own database holding the genesis
    /// block. Nothing is started.
    pub async fn new(config: ClusterConfig) -> NodeResult<Self> {
        if config.size < 1 {
            return Err(NodeError::invalid_config("cluster without nodes"));
        }

        let members = (0..config.size).map(member).collect::<NodeResult<Vec<_>>>()?;
        let addresses: Vec<Address> = members.iter().map(|m| m.address().clone()).collect();
        let suffrage: Arc<dyn Suffrage> = if config.roundrobin {
            Arc::new(RoundrobinSuffrage::new(addresses.clone(), config.policy.number_of_acting_suffrage_nodes)?)
        } else {
            Arc::new(FixedSuffrage::new(addresses[0].clone(), addresses.clone()))
        };

        let genesis = GenesisGenerator::new(members[0].clone(), config.network_id.clone())
            .with_created_at(config.genesis_at)
            .generate()?;

        let mut cluster = Self {
            network: LocalNetwork::new(),
            members,
            suffrage,
            genesis,
            nodes: Vec::with_capacity(config.size),
            config,
        };
        for index in 0..cluster.config.size {
            let node = cluster.build_node(index, &local_conn_info(&format!("n{}", index))).await?;
            cluster.nodes.push(node);
        }

        info!(size = cluster.nodes.len(), genesis = %cluster.genesis.hash(), "local cluster built");
        Ok(cluster)
    }

    /// New node with the identity of member `index`, on its own genesis
    /// database. Started next to a running instance of that identity, it
    /// takes over through handover.
    pub async fn build_node(&self, index: usize, conn_info: &str) -> NodeResult<Arc<AgoraNode>> {
        self.build_node_with(index, conn_info, None).await
    }

    pub async fn build_node_with(
        &self,
        index: usize,
        conn_info: &str,
        operations: Option<OperationsSource>,
    ) -> NodeResult<Arc<AgoraNode>> {
        let local = self
            .members
            .get(index)
            .cloned()
            .ok_or_else(|| NodeError::invalid_config(format!("no cluster member {}", index)))?;

        let database = Arc::new(MemoryDatabase::new());
        self.genesis.store(&database).await?;

        let peers = self
            .members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .map(|(i, m)| RemoteNode {
                address: m.address().clone(),
                public_key: *m.public_key(),
                conn_info: local_conn_info(&format!("n{}", i)),
            })
            .collect();

        AgoraNode::new(NodeParts {
            conn_info: conn_info.to_string(),
            local,
            policy: self.config.policy.clone(),
            suffrage: self.suffrage.clone(),
            peers,
            network: self.network.clone(),
            database,
            states: self.config.states.clone(),
            clock: Arc::new(SystemClock),
            handover: true,
            operations,
        })
    }

    /// Replace member `index` before the cluster starts
    pub fn replace(&mut self, index: usize, node: Arc<AgoraNode>) -> NodeResult<()> {
        let slot = self
            .nodes
            .get_mut(index)
            .ok_or_else(|| NodeError::invalid_config(format!("no cluster member {}", index)))?;
        *slot = node;
        Ok(())
    }

    pub async fn start(&self) -> NodeResult<()> {
        for node in &self.nodes {
            node.start().await?;
        }
        info!(size = self.nodes.len(), "local cluster started");
        Ok(())
    }

    pub async fn stop(&self) -> NodeResult<()> {
        for node in &self.nodes {
            ignore_stopped(node.stop().await)?;
        }
        info!("local cluster stopped");
        Ok(())
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    pub fn genesis(&self) -> &Genesis {
        &self.genesis
    }

    pub fn nodes(&self) -> &[Arc<AgoraNode>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Arc<AgoraNode>> {
        self.nodes.get(index)
    }

    pub fn heights(&self) -> Vec<Height> {
        self.nodes.iter().map(|n| n.last_height()).collect()
    }

    /// Wait until every node in `indexes` stored a block at `height`
    pub async fn wait_height(&self, indexes: &[usize], height: Height, timeout: Duration) -> NodeResult<()> {
        let wait = async {
            loop {
                let reached = indexes
                    .iter()
                    .filter_map(|i| self.nodes.get(*i))
                    .all(|n| n.last_height() >= height);
                if reached {
                    return;
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            NodeError::Timeout(format!(
                "cluster did not reach height {} in {:?}; heights={:?}",
                height,
                timeout,
                self.heights()
            ))
        })?;
        debug!(height = %height, "cluster reached height");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_members_share_genesis() {
        let cluster = LocalCluster::new(ClusterConfig::new(3, NetworkId::new("test").unwrap()))
            .await
            .unwrap();

        assert_eq!(cluster.nodes().len(), 3);
        assert_eq!(cluster.heights(), vec![Height::GENESIS; 3]);
        for node in cluster.nodes() {
            assert_eq!(
                node.database().block(Height::GENESIS).unwrap().hash(),
                cluster.genesis().hash()
            );
            assert_eq!(node.nodepool().remote_channels().len(), 2);
        }
        assert_eq!(cluster.node(1).unwrap().conn_info(), "local://n1");
    }

    #[test]
    fn test_member_identity_is_stable() {
        let a = member(2).unwrap();
        let b = member(2).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(member(1).unwrap().public_key(), a.public_key());
    }

    #[tokio::test]
    async fn test_empty_cluster_rejected() {
        assert!(LocalCluster::new(ClusterConfig::new(0, NetworkId::new("test").unwrap()))
            .await
            .is_err());
    }
}
