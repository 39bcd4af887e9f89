//! # Agora node
//!
//! Wires the consensus state machine to its collaborators and answers the
//! requests of peers.
//!
//! ```text
//!              ┌────────────────────── AgoraNode ──────────────────────┐
//!   peer ─────►│ SealHandler ─► seal store ─► passthroughs             │
//!              │      │                                                │
//!              │      └──────► StateMachine ◄── Nodepool, Suffrage     │
//!              │                   │                                   │
//!              │      MemoryProcessorPool ─► MemoryDatabase ◄─ Syncers │
//!              └───────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use agora_consensus::ballot::Proposal;
use agora_consensus::handover::check_handover_seal;
use agora_consensus::network::{ConnInfo, RemoteNode};
use agora_consensus::{
    Block, ConsensusResult, Database, Handover, HandoverSeal, HandoverSealKind, LocalNode, LocalPolicy,
    NodeInfo, Nodepool, OperationsSource, SealHandler, Seal, StateEvent, StateMachine, StateMachineBuilder,
    StatesConfig, Suffrage,
};
use agora_core::{Address, AgoraError, Height, NodeState, SharedClock, SystemClock};
use agora_crypto::Hash;

use crate::config::NodeConfig;
use crate::error::NodeResult;
use crate::local_network::{LocalDiscovery, LocalNetwork, LocalSyncersFactory};
use crate::memory::{MemoryDatabase, MemoryProcessorPool};

/// Everything a node is built from
pub struct NodeParts {
    pub conn_info: ConnInfo,
    pub local: LocalNode,
    pub policy: LocalPolicy,
    pub suffrage: Arc<dyn Suffrage>,
    /// Other members with their keys and connection addresses
    pub peers: Vec<RemoteNode>,
    pub network: Arc<LocalNetwork>,
    pub database: Arc<MemoryDatabase>,
    pub states: StatesConfig,
    pub clock: SharedClock,
    /// Run the handover engine: take over from an older instance of this
    /// identity, or hand over to a newer one
    pub handover: bool,
    pub operations: Option<OperationsSource>,
}

impl NodeParts {
    /// Parts described by `config`, on `network` and `database`
    pub fn from_config(
        config: &NodeConfig,
        network: Arc<LocalNetwork>,
        database: Arc<MemoryDatabase>,
    ) -> NodeResult<Self> {
        Ok(Self {
            conn_info: config.node.conn_info.clone(),
            local: config.local_node()?,
            policy: config.policy(),
            suffrage: config.suffrage()?,
            peers: config.peers()?,
            network,
            database,
            states: config.node.states.states_config(),
            clock: Arc::new(SystemClock),
            handover: config.node.handover,
            operations: None,
        })
    }
}

/// One node of an Agora network
pub struct AgoraNode {
    conn_info: ConnInfo,
    local: LocalNode,
    policy: LocalPolicy,
    clock: SharedClock,
    network: Arc<LocalNetwork>,
    database: Arc<MemoryDatabase>,
    processors: Arc<MemoryProcessorPool>,
    nodepool: Arc<Nodepool>,
    handover: Option<Arc<Handover>>,
    machine: Arc<StateMachine>,
}

impl AgoraNode {
    pub fn new(parts: NodeParts) -> NodeResult<Arc<Self>> {
        let NodeParts {
            conn_info,
            local,
            policy,
            suffrage,
            peers,
            network,
            database,
            states,
            clock,
            handover,
            operations,
        } = parts;

        let nodepool = Arc::new(Nodepool::new(local.clone()));
        for peer in &peers {
            let channel = network.channel(&peer.conn_info, &conn_info);
            nodepool.add(peer.address.clone(), peer.public_key, Some(channel))?;
        }

        let processors = Arc::new(MemoryProcessorPool::new(database.clone()));
        let syncers = Arc::new(LocalSyncersFactory::new(database.clone(), policy.network_id.clone()));

        let mut builder = StateMachineBuilder::new(
            local.clone(),
            policy.clone(),
            suffrage.clone(),
            database.clone(),
            nodepool.clone(),
            processors.clone(),
            syncers,
        )
        .with_discovery(Arc::new(LocalDiscovery::new(
            network.clone(),
            local.address().clone(),
            conn_info.clone(),
        )))
        .with_clock(clock.clone())
        .with_config(states);

        if let Some(operations) = operations {
            builder = builder.with_operations(operations);
        }

        let handover = if handover {
            let hd = Arc::new(Handover::new(
                conn_info.clone(),
                local.clone(),
                policy.clone(),
                nodepool.clone(),
                suffrage,
                network.loader(&conn_info),
                clock.clone(),
            ));
            builder = builder.with_handover(hd.clone());
            Some(hd)
        } else {
            None
        };

        let machine = builder.build()?;
        debug!(node = %local.address(), conn_info = %conn_info, peers = peers.len(), "node built");

        Ok(Arc::new(Self {
            conn_info,
            local,
            policy,
            clock,
            network,
            database,
            processors,
            nodepool,
            handover,
            machine,
        }))
    }

    pub fn from_config(
        config: &NodeConfig,
        network: Arc<LocalNetwork>,
        database: Arc<MemoryDatabase>,
    ) -> NodeResult<Arc<Self>> {
        Self::new(NodeParts::from_config(config, network, database)?)
    }

    /// Join the local network and start the state machine
    pub async fn start(self: &Arc<Self>) -> NodeResult<()> {
        let handler: Arc<dyn SealHandler> = self.clone();
        self.network.register(&self.conn_info, &handler);
        self.network.register_nodepool(&self.conn_info, &self.nodepool);

        if let Err(e) = self.machine.start().await {
            self.network.unregister(&self.conn_info);
            return Err(e.into());
        }

        info!(node = %self.local.address(), conn_info = %self.conn_info, "node started");
        Ok(())
    }

    pub async fn stop(&self) -> NodeResult<()> {
        let result = self.machine.stop().await;
        self.network.unregister(&self.conn_info);
        result?;

        info!(node = %self.local.address(), conn_info = %self.conn_info, "node stopped");
        Ok(())
    }

    /// The operator approves taking over from the old node
    pub async fn start_handover(&self) -> NodeResult<()> {
        Ok(self.machine.start_handover().await?)
    }

    pub fn conn_info(&self) -> &str {
        &self.conn_info
    }

    pub fn address(&self) -> &Address {
        self.local.address()
    }

    pub fn state(&self) -> NodeState {
        self.machine.state()
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    pub fn processors(&self) -> &Arc<MemoryProcessorPool> {
        &self.processors
    }

    pub fn nodepool(&self) -> &Arc<Nodepool> {
        &self.nodepool
    }

    pub fn handover(&self) -> Option<&Arc<Handover>> {
        self.handover.as_ref()
    }

    pub fn last_height(&self) -> Height {
        self.database.last_height()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.machine.subscribe()
    }

    /// Copy `seal` to the passthroughs it was not received from
    fn passthrough(&self, seal: &Seal, from: Option<&str>) {
        for ch in self.nodepool.passthrough_targets(seal, from) {
            let seal = seal.clone();
            let timeout = self.policy.network_connection_timeout();
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, ch.send_seal(&seal)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => trace!(conn_info = ch.conn_info(), error = %e, "failed to pass seal through"),
                    Err(_) => trace!(conn_info = ch.conn_info(), "passing seal through timed out"),
                }
            });
        }
    }

    fn check_handover_seal(&self, seal: &HandoverSeal) -> ConsensusResult<()> {
        check_handover_seal(seal, &self.local, &self.policy, self.clock.now())
    }
}

#[async_trait]
impl SealHandler for AgoraNode {
    async fn new_seal(&self, seal: Seal, from: Option<ConnInfo>) -> ConsensusResult<()> {
        seal.is_valid(&self.policy.network_id)?;

        if let Seal::Handover(hs) = seal {
            match hs.kind {
                HandoverSealKind::End => self.end_handover(hs).await?,
                HandoverSealKind::Start | HandoverSealKind::Ping => self.ping_handover(hs).await?,
            };
            return Ok(());
        }

        if self.database.has_seal(&seal.hash()).await? {
            return Err(AgoraError::KnownSeal(seal.hash().to_string()).into());
        }
        self.database.new_seals(std::slice::from_ref(&seal)).await?;

        self.passthrough(&seal, from.as_deref());

        match self.machine.new_seal(&seal).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_ignore() => {
                trace!(seal = %seal.hash(), error = %e, "seal ignored");
                Ok(())
            }
            Err(e) => {
                debug!(seal = %seal.hash(), from = ?from, error = %e, "seal rejected");
                Err(e)
            }
        }
    }

    async fn node_info(&self) -> ConsensusResult<NodeInfo> {
        let nodes = self
            .nodepool
            .remote_channels()
            .into_iter()
            .filter_map(|(address, ch)| {
                let public_key = self.nodepool.public_key(&address)?;
                Some(RemoteNode {
                    address,
                    public_key,
                    conn_info: ch.conn_info().to_string(),
                })
            })
            .collect();

        Ok(NodeInfo {
            address: self.local.address().clone(),
            public_key: *self.local.public_key(),
            network_id: self.policy.network_id.clone(),
            state: self.machine.state(),
            last_block: self.database.last_manifest().await?,
            conn_info: self.conn_info.clone(),
            nodes,
        })
    }

    async fn seals(&self, hashes: &[Hash]) -> ConsensusResult<Vec<Seal>> {
        Ok(self.database.seals(hashes))
    }

    async fn proposal(&self, fact_hash: &Hash) -> ConsensusResult<Option<Proposal>> {
        Ok(self.database.proposal(fact_hash).await?)
    }

    async fn blocks(&self, heights: &[Height]) -> ConsensusResult<Vec<Block>> {
        Ok(self.database.blocks(heights))
    }

    /// The new node of this identity keeps asking; the seals reaching
    /// here are copied to it
    async fn ping_handover(&self, seal: HandoverSeal) -> ConsensusResult<bool> {
        self.check_handover_seal(&seal)?;
        if seal.conn_info == self.conn_info {
            return Err(AgoraError::invalid("handover ping from own connection").into());
        }

        if !self.nodepool.exists_passthrough(&seal.conn_info) {
            let channel = self.network.channel(&seal.conn_info, &self.conn_info);
            self.nodepool.set_passthrough(channel, None)?;
            info!(new_node = %seal.conn_info, "passthrough to new node set");
        }
        debug!(from = %seal.conn_info, kind = ?seal.kind, "handover ping accepted");
        Ok(true)
    }

    async fn end_handover(&self, seal: HandoverSeal) -> ConsensusResult<bool> {
        self.check_handover_seal(&seal)?;

        match self.machine.end_handover(&seal.conn_info).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_handover_rejected() => {
                warn!(from = %seal.conn_info, error = %e, "end handover rejected");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for AgoraNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgoraNode")
            .field("address", self.local.address())
            .field("conn_info", &self.conn_info)
            .field("state", &self.machine.state())
            .finish()
    }
}

/// Treat stopping an already stopped node as done
pub fn ignore_stopped(result: NodeResult<()>) -> NodeResult<()> {
    match result {
        Err(crate::error::NodeError::Consensus(e)) if e.is_daemon_already_stopped() => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::GenesisGenerator;
    use agora_consensus::{Ballot, BallotFact, FixedSuffrage};
    use agora_core::{NetworkId, Round};
    use agora_crypto::PrivateKey;
    use chrono::Utc;

    fn network_id() -> NetworkId {
        NetworkId::new("test").unwrap()
    }

    async fn single(handover: bool) -> (Arc<AgoraNode>, Arc<LocalNetwork>) {
        let local = LocalNode::new(Address::new("n0").unwrap(), PrivateKey::from_seed(&[3u8; 32]));
        let database = Arc::new(MemoryDatabase::new());
        GenesisGenerator::new(local.clone(), network_id())
            .generate()
            .unwrap()
            .store(&database)
            .await
            .unwrap();

        let network = LocalNetwork::new();
        let node = AgoraNode::new(NodeParts {
            conn_info: "local://n0".into(),
            local: local.clone(),
            policy: LocalPolicy::default().with_network_id(network_id()),
            suffrage: Arc::new(FixedSuffrage::new(local.address().clone(), vec![local.address().clone()])),
            peers: Vec::new(),
            network: network.clone(),
            database,
            states: StatesConfig::default(),
            clock: Arc::new(SystemClock),
            handover,
            operations: None,
        })
        .unwrap();
        (node, network)
    }

    #[tokio::test]
    async fn test_node_info_before_start() {
        let (node, _network) = single(false).await;

        let info = node.node_info().await.unwrap();
        assert_eq!(info.address, *node.address());
        assert_eq!(info.state, NodeState::Stopped);
        assert_eq!(info.last_height(), Height::GENESIS);
        assert!(info.nodes.is_empty());
        assert_eq!(node.blocks(&[Height::GENESIS]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_known_seal_rejected() {
        let (node, _network) = single(false).await;
        let local = node.local.clone();
        let previous = node.database.block(Height::GENESIS).unwrap().hash();

        let ballot = Ballot::new(
            BallotFact::init(Height(1), Round(0), previous),
            node.database.block(Height::GENESIS).unwrap().accept_voteproof,
            None,
            &local,
            &network_id(),
            Utc::now(),
        );
        let seal = Seal::from(ballot);

        // the machine is not running; the seal is stored regardless
        let _ = node.new_seal(seal.clone(), Some("local://n1".into())).await;
        assert_eq!(node.seals(&[seal.hash()]).await.unwrap().len(), 1);

        let err = node.new_seal(seal, None).await.unwrap_err();
        assert!(err.is_known_seal());
    }

    #[tokio::test]
    async fn test_handover_seal_from_other_identity() {
        let (node, _network) = single(true).await;

        let stranger = LocalNode::new(Address::new("n0").unwrap(), PrivateKey::from_seed(&[4u8; 32]));
        let seal = HandoverSeal::new(
            HandoverSealKind::Ping,
            &stranger,
            "local://n0-new",
            &network_id(),
            Utc::now(),
        );
        assert!(node.ping_handover(seal).await.is_err());

        // own connection
        let seal = node.handover().unwrap().seal(HandoverSealKind::Ping);
        assert!(node.ping_handover(seal).await.is_err());

        let seal = HandoverSeal::new(
            HandoverSealKind::Start,
            &node.local,
            "local://n0-new",
            &network_id(),
            Utc::now(),
        );
        assert!(node.ping_handover(seal).await.unwrap());
        assert!(node.nodepool().exists_passthrough("local://n0-new"));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (node, network) = single(false).await;
        assert!(node.stop().await.is_err());
        assert!(ignore_stopped(node.stop().await).is_ok());
        assert!(!network.is_joined("local://n0"));
    }
}
