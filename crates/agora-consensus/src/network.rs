//! # Network collaborators
//!
//! The consensus core talks to other nodes only through [`Channel`]s. The
//! [`Nodepool`] keeps one optional channel per known node (a missing channel
//! marks the node as dead) plus a set of passthrough channels that receive
//! copies of the seals this node sees.
//!
//! ```text
//!                 ┌──────────── Nodepool ─────────────┐
//!   broadcast ──► │ n1 ─► Channel                     │
//!                 │ n2 ─► (dead)                      │
//!                 │ passthrough[conn] ─► filter ─► Ch │
//!                 └───────────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use agora_core::{Address, AgoraError, Height, NetworkId, NodeState, Result};
use agora_crypto::{Hash, PublicKey};

use crate::ballot::{HandoverSeal, Proposal, Seal};
use crate::database::Manifest;
use crate::error::ConsensusResult;
use crate::local::LocalNode;
use crate::processor::Block;

/// Connection address of a node, e.g. `local://n0`
pub type ConnInfo = String;

/// Member of a node's view of the network
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub address: Address,
    pub public_key: PublicKey,
    pub conn_info: ConnInfo,
}

/// What a node reports about itself
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: Address,
    pub public_key: PublicKey,
    pub network_id: NetworkId,
    pub state: NodeState,
    pub last_block: Option<Manifest>,
    pub conn_info: ConnInfo,
    pub nodes: Vec<RemoteNode>,
}

impl NodeInfo {
    pub fn knows(&self, address: &Address) -> Option<&RemoteNode> {
        self.nodes.iter().find(|n| n.address == *address)
    }

    pub fn last_height(&self) -> Height {
        self.last_block.as_ref().map(|m| m.height).unwrap_or(Height::NIL)
    }
}

/// Connection to a remote node
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug {
    fn conn_info(&self) -> &str;

    async fn send_seal(&self, seal: &Seal) -> ConsensusResult<()>;

    async fn node_info(&self) -> ConsensusResult<NodeInfo>;

    async fn seals(&self, hashes: &[Hash]) -> ConsensusResult<Vec<Seal>>;

    /// Proposal by its fact hash
    async fn proposal_by_hash(&self, fact_hash: &Hash) -> ConsensusResult<Option<Proposal>>;

    /// Blocks at the given heights, skipping the missing ones
    async fn blocks(&self, heights: &[Height]) -> ConsensusResult<Vec<Block>>;

    async fn ping_handover(&self, seal: &HandoverSeal) -> ConsensusResult<bool>;

    async fn end_handover(&self, seal: &HandoverSeal) -> ConsensusResult<bool>;
}

/// Opens channels by connection address
#[async_trait]
pub trait ChannelLoader: Send + Sync {
    async fn load(&self, conn_info: &str) -> ConsensusResult<Arc<dyn Channel>>;
}

/// Server side of a [`Channel`]: what a node answers to its peers
#[async_trait]
pub trait SealHandler: Send + Sync {
    /// Incoming seal; `from` is the connection it arrived on, if any
    async fn new_seal(&self, seal: Seal, from: Option<ConnInfo>) -> ConsensusResult<()>;

    async fn node_info(&self) -> ConsensusResult<NodeInfo>;

    async fn seals(&self, hashes: &[Hash]) -> ConsensusResult<Vec<Seal>>;

    async fn proposal(&self, fact_hash: &Hash) -> ConsensusResult<Option<Proposal>>;

    async fn blocks(&self, heights: &[Height]) -> ConsensusResult<Vec<Block>>;

    async fn ping_handover(&self, seal: HandoverSeal) -> ConsensusResult<bool>;

    async fn end_handover(&self, seal: HandoverSeal) -> ConsensusResult<bool>;
}

/// Membership in the gossip set of the network
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn join(&self) -> ConsensusResult<()>;

    async fn leave(&self) -> ConsensusResult<()>;

    fn is_joined(&self) -> bool;
}

/// Decides whether a seal is copied to a passthrough channel
pub type PassthroughFilter = Arc<dyn Fn(&Seal) -> bool + Send + Sync>;

struct Passthrough {
    channel: Arc<dyn Channel>,
    filter: Option<PassthroughFilter>,
}

impl Passthrough {
    fn allows(&self, seal: &Seal) -> bool {
        self.filter.as_ref().map(|f| f(seal)).unwrap_or(true)
    }
}

/// Known node: the key it signs with and its channel; `None` marks it dead
struct PoolNode {
    public_key: PublicKey,
    channel: Option<Arc<dyn Channel>>,
}

/// Known nodes and their channels
pub struct Nodepool {
    local: LocalNode,
    nodes: RwLock<IndexMap<Address, PoolNode>>,
    passthroughs: RwLock<IndexMap<ConnInfo, Passthrough>>,
}

impl Nodepool {
    pub fn new(local: LocalNode) -> Self {
        let mut nodes = IndexMap::new();
        nodes.insert(
            local.address().clone(),
            PoolNode {
                public_key: *local.public_key(),
                channel: None,
            },
        );

        Self {
            local,
            nodes: RwLock::new(nodes),
            passthroughs: RwLock::new(IndexMap::new()),
        }
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    fn is_local(&self, address: &Address) -> bool {
        self.local.address() == address
    }

    /// Register a remote node signing with `public_key`; `None` channel
    /// marks it dead
    pub fn add(&self, address: Address, public_key: PublicKey, channel: Option<Arc<dyn Channel>>) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&address) {
            return Err(AgoraError::Duplicated(format!("node {} already in nodepool", address)));
        }
        nodes.insert(address, PoolNode { public_key, channel });
        Ok(())
    }

    pub fn set_channel(&self, address: &Address, channel: Option<Arc<dyn Channel>>) -> Result<()> {
        if self.is_local(address) {
            return Err(AgoraError::invalid("local node can not have channel"));
        }

        match self.nodes.write().get_mut(address) {
            Some(node) => {
                node.channel = channel;
                Ok(())
            }
            None => Err(AgoraError::not_found(format!("node {} not in nodepool", address))),
        }
    }

    pub fn remove(&self, address: &Address) -> Result<()> {
        if self.is_local(address) {
            return Err(AgoraError::invalid("local node can not be removed"));
        }

        self.nodes
            .write()
            .shift_remove(address)
            .map(|_| ())
            .ok_or_else(|| AgoraError::not_found(format!("node {} not in nodepool", address)))
    }

    pub fn exists(&self, address: &Address) -> bool {
        self.nodes.read().contains_key(address)
    }

    /// Key the node at `address` signs with, local node included
    pub fn public_key(&self, address: &Address) -> Option<PublicKey> {
        self.nodes.read().get(address).map(|n| n.public_key)
    }

    /// Local node, or a remote node with a live channel
    pub fn is_alive(&self, address: &Address) -> bool {
        self.is_local(address) || self.channel(address).is_some()
    }

    /// Channel of a live remote node
    pub fn channel(&self, address: &Address) -> Option<Arc<dyn Channel>> {
        self.nodes.read().get(address).and_then(|n| n.channel.clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Remote nodes with a channel, in insertion order
    pub fn remote_channels(&self) -> Vec<(Address, Arc<dyn Channel>)> {
        self.nodes
            .read()
            .iter()
            .filter(|(address, _)| !self.is_local(address))
            .filter_map(|(address, n)| n.channel.clone().map(|ch| (address.clone(), ch)))
            .collect()
    }

    pub fn len_remote_alives(&self) -> usize {
        self.nodes
            .read()
            .iter()
            .filter(|(address, n)| !self.is_local(address) && n.channel.is_some())
            .count()
    }

    /// Visit every remote node until `f` returns false
    pub fn traverse_remotes<F>(&self, mut f: F)
    where
        F: FnMut(&Address, Option<&Arc<dyn Channel>>) -> bool,
    {
        let nodes = self.nodes.read();
        for (address, n) in nodes.iter() {
            if self.is_local(address) {
                continue;
            }
            if !f(address, n.channel.as_ref()) {
                break;
            }
        }
    }

    /// Copy seals to `channel`; replaces the filter of an existing
    /// passthrough with the same connection address
    pub fn set_passthrough(&self, channel: Arc<dyn Channel>, filter: Option<PassthroughFilter>) -> Result<()> {
        let conn_info = channel.conn_info().to_string();

        let clash = self
            .nodes
            .read()
            .values()
            .filter_map(|n| n.channel.as_ref())
            .any(|ch| ch.conn_info() == conn_info);
        if clash {
            return Err(AgoraError::invalid(format!(
                "passthrough {} is already a node channel",
                conn_info
            )));
        }

        let mut passthroughs = self.passthroughs.write();
        match passthroughs.get_mut(&conn_info) {
            Some(p) => p.filter = filter,
            None => {
                passthroughs.insert(conn_info.clone(), Passthrough { channel, filter });
            }
        }
        debug!(conn_info = %conn_info, "passthrough set");
        Ok(())
    }

    pub fn remove_passthrough(&self, conn_info: &str) -> Result<()> {
        self.passthroughs
            .write()
            .shift_remove(conn_info)
            .map(|_| debug!(conn_info, "passthrough removed"))
            .ok_or_else(|| AgoraError::not_found(format!("passthrough {} not found", conn_info)))
    }

    pub fn exists_passthrough(&self, conn_info: &str) -> bool {
        self.passthroughs.read().contains_key(conn_info)
    }

    /// Passthrough channels that should get `seal`; the one it came from is
    /// skipped
    pub fn passthrough_targets(&self, seal: &Seal, from: Option<&str>) -> Vec<Arc<dyn Channel>> {
        self.passthroughs
            .read()
            .iter()
            .filter(|(conn_info, _)| from != Some(conn_info.as_str()))
            .filter(|(_, p)| p.allows(seal))
            .map(|(_, p)| p.channel.clone())
            .collect()
    }

    /// Send `seal` to every live remote accepted by `include` and to every
    /// passthrough allowing it. Returns the number of successful sends.
    pub async fn broadcast<F>(&self, seal: &Seal, from: Option<&str>, timeout: Duration, include: F) -> usize
    where
        F: Fn(&Address) -> bool,
    {
        let mut targets: Vec<Arc<dyn Channel>> = self
            .remote_channels()
            .into_iter()
            .filter(|(address, _)| include(address))
            .map(|(_, ch)| ch)
            .collect();
        targets.extend(self.passthrough_targets(seal, from));

        let sends = targets.iter().map(|ch| async move {
            match tokio::time::timeout(timeout, ch.send_seal(seal)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    trace!(conn_info = ch.conn_info(), error = %e, "failed to send seal");
                    false
                }
                Err(_) => {
                    trace!(conn_info = ch.conn_info(), "sending seal timed out");
                    false
                }
            }
        });

        join_all(sends).await.into_iter().filter(|ok| *ok).count()
    }
}

impl fmt::Debug for Nodepool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nodepool")
            .field("local", self.local.address())
            .field("nodes", &self.len())
            .field("passthroughs", &self.passthroughs.read().len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ballot::{BallotFact, HandoverSealKind};
    use crate::test_utils::*;
    use agora_core::Round;
    use chrono::Utc;
    use parking_lot::Mutex;

    /// Channel recording what it is sent
    #[derive(Debug)]
    pub(crate) struct RecordingChannel {
        conn_info: String,
        pub sent: Mutex<Vec<Seal>>,
        /// Proposals served by `proposal_by_hash`
        pub proposals: Mutex<Vec<Proposal>>,
        pub fail: bool,
    }

    impl RecordingChannel {
        pub(crate) fn new(conn_info: &str) -> Arc<Self> {
            Arc::new(Self {
                conn_info: conn_info.to_string(),
                sent: Mutex::new(Vec::new()),
                proposals: Mutex::new(Vec::new()),
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn conn_info(&self) -> &str {
            &self.conn_info
        }

        async fn send_seal(&self, seal: &Seal) -> ConsensusResult<()> {
            if self.fail {
                return Err(AgoraError::Connection("refused".into()).into());
            }
            self.sent.lock().push(seal.clone());
            Ok(())
        }

        async fn node_info(&self) -> ConsensusResult<NodeInfo> {
            Err(AgoraError::Connection("no node info".into()).into())
        }

        async fn seals(&self, _: &[Hash]) -> ConsensusResult<Vec<Seal>> {
            Ok(Vec::new())
        }

        async fn proposal_by_hash(&self, fact_hash: &Hash) -> ConsensusResult<Option<Proposal>> {
            Ok(self.proposals.lock().iter().find(|p| p.fact().hash() == *fact_hash).cloned())
        }

        async fn blocks(&self, _: &[Height]) -> ConsensusResult<Vec<Block>> {
            Ok(Vec::new())
        }

        async fn ping_handover(&self, _: &HandoverSeal) -> ConsensusResult<bool> {
            Ok(true)
        }

        async fn end_handover(&self, _: &HandoverSeal) -> ConsensusResult<bool> {
            Ok(true)
        }
    }

    fn pool() -> (Nodepool, Vec<LocalNode>) {
        let nodes = test_nodes(3);
        (Nodepool::new(nodes[0].clone()), nodes)
    }

    fn init_seal(node: &LocalNode, height: i64) -> Seal {
        sign_ballot(node, BallotFact::init(Height(height), Round(0), genesis_hash()), None, None).into()
    }

    #[test]
    fn test_add_and_channels() {
        let (pool, nodes) = pool();
        let ch = RecordingChannel::new("local://n1");

        pool.add(nodes[1].address().clone(), *nodes[1].public_key(), Some(ch)).unwrap();
        pool.add(nodes[2].address().clone(), *nodes[2].public_key(), None).unwrap();

        assert!(matches!(
            pool.add(nodes[1].address().clone(), *nodes[1].public_key(), None),
            Err(AgoraError::Duplicated(_))
        ));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.len_remote_alives(), 1);
        assert!(pool.channel(nodes[2].address()).is_none());

        let mut visited = Vec::new();
        pool.traverse_remotes(|a, _| {
            visited.push(a.clone());
            true
        });
        assert_eq!(visited, vec![nodes[1].address().clone(), nodes[2].address().clone()]);
    }

    #[test]
    fn test_set_channel_and_remove() {
        let (pool, nodes) = pool();
        assert!(pool.set_channel(nodes[1].address(), None).unwrap_err().is_not_found());
        assert!(pool.remove(nodes[0].address()).is_err());

        pool.add(nodes[1].address().clone(), *nodes[1].public_key(), None).unwrap();
        pool.set_channel(nodes[1].address(), Some(RecordingChannel::new("local://n1")))
            .unwrap();
        assert_eq!(pool.len_remote_alives(), 1);

        pool.remove(nodes[1].address()).unwrap();
        assert!(!pool.exists(nodes[1].address()));
    }

    #[test]
    fn test_passthrough_filter_and_origin() {
        let (pool, nodes) = pool();
        let old = RecordingChannel::new("local://n0-old");

        let only_height_2: PassthroughFilter = Arc::new(|seal: &Seal| match seal.as_ballot() {
            Some(b) => b.height() == Height(2),
            None => true,
        });
        pool.set_passthrough(old.clone(), Some(only_height_2)).unwrap();

        assert_eq!(pool.passthrough_targets(&init_seal(&nodes[1], 2), None).len(), 1);
        assert!(pool.passthrough_targets(&init_seal(&nodes[1], 3), None).is_empty());
        assert!(pool
            .passthrough_targets(&init_seal(&nodes[1], 2), Some("local://n0-old"))
            .is_empty());

        let handover: Seal =
            HandoverSeal::new(HandoverSealKind::Ping, &nodes[0], "local://n0", &network(), Utc::now()).into();
        assert_eq!(pool.passthrough_targets(&handover, None).len(), 1);

        // a second set only swaps the filter
        pool.set_passthrough(old, None).unwrap();
        assert_eq!(pool.passthrough_targets(&init_seal(&nodes[1], 3), None).len(), 1);

        pool.remove_passthrough("local://n0-old").unwrap();
        assert!(pool.remove_passthrough("local://n0-old").unwrap_err().is_not_found());
    }

    #[test]
    fn test_passthrough_clashing_with_node_channel() {
        let (pool, nodes) = pool();
        let ch = RecordingChannel::new("local://n1");
        pool.add(nodes[1].address().clone(), *nodes[1].public_key(), Some(ch.clone())).unwrap();

        assert!(pool.set_passthrough(ch, None).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_remotes_and_passthroughs() {
        let (pool, nodes) = pool();
        let n1 = RecordingChannel::new("local://n1");
        let n2 = Arc::new(RecordingChannel {
            conn_info: "local://n2".into(),
            sent: Mutex::new(Vec::new()),
            proposals: Mutex::new(Vec::new()),
            fail: true,
        });
        let old = RecordingChannel::new("local://n0-old");

        pool.add(nodes[1].address().clone(), *nodes[1].public_key(), Some(n1.clone())).unwrap();
        pool.add(nodes[2].address().clone(), *nodes[2].public_key(), Some(n2)).unwrap();
        pool.set_passthrough(old.clone(), None).unwrap();

        let seal = init_seal(&nodes[0], 1);
        let sent = pool.broadcast(&seal, None, Duration::from_secs(1), |_| true).await;

        assert_eq!(sent, 2);
        assert_eq!(n1.sent.lock().len(), 1);
        assert_eq!(old.sent.lock().len(), 1);

        let skip_n1 = nodes[1].address().clone();
        let sent = pool.broadcast(&seal, None, Duration::from_secs(1), |a| *a != skip_n1).await;
        assert_eq!(sent, 1);
    }
}
