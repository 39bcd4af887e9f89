//! # Local network
//!
//! In-process transport between nodes. Every node registers its
//! [`SealHandler`] under a connection address such as `local://n0`; a
//! [`LocalChannel`] to that address encodes each message to bytes and
//! back, so nothing crosses nodes by reference.
//!
//! ```text
//!   n0 ── LocalChannel(local://n1) ── bincode ──► LocalNetwork ──► n1 SealHandler
//!                                                     │
//!                                       down: local://n2 ✗ connection error
//! ```
//!
//! Joining the discovery points the nodepools of the other nodes at the
//! joining connection, so a new process of an identity receives what its
//! old process used to.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use agora_consensus::ballot::Proposal;
use agora_consensus::network::ConnInfo;
use agora_consensus::syncer::{BlockSavedHook, FinishedHook};
use agora_consensus::{
    Block, Channel, ChannelLoader, ConsensusError, ConsensusResult, Discovery, HandoverSeal, Manifest, NodeInfo,
    Nodepool, SealHandler, Seal, SyncSource, Syncers, SyncersFactory,
};
use agora_core::{Address, AgoraError, Height, NetworkId};
use agora_crypto::Hash;

use crate::memory::MemoryDatabase;

/// Connection address of a local node named `name`
pub fn local_conn_info(name: &str) -> ConnInfo {
    format!("local://{}", name)
}

/// Registry of the nodes running in this process
#[derive(Default)]
pub struct LocalNetwork {
    handlers: DashMap<ConnInfo, Weak<dyn SealHandler>>,
    nodepools: DashMap<ConnInfo, Weak<Nodepool>>,
    down: DashSet<ConnInfo>,
    joined: DashMap<ConnInfo, Address>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, conn_info: &str, handler: &Arc<dyn SealHandler>) {
        self.handlers.insert(conn_info.to_string(), Arc::downgrade(handler));
        debug!(conn_info, "node registered to local network");
    }

    /// Nodepool of the node at `conn_info`, kept up to date with the
    /// discovery members
    pub fn register_nodepool(&self, conn_info: &str, nodepool: &Arc<Nodepool>) {
        self.nodepools.insert(conn_info.to_string(), Arc::downgrade(nodepool));
    }

    pub fn unregister(&self, conn_info: &str) {
        self.handlers.remove(conn_info);
        self.nodepools.remove(conn_info);
        self.joined.remove(conn_info);
        debug!(conn_info, "node unregistered from local network");
    }

    /// Cut a node off, or bring it back
    pub fn set_down(&self, conn_info: &str, down: bool) {
        if down {
            self.down.insert(conn_info.to_string());
        } else {
            self.down.remove(conn_info);
        }
        info!(conn_info, down, "local network link changed");
    }

    pub fn is_joined(&self, conn_info: &str) -> bool {
        self.joined.contains_key(conn_info)
    }

    fn join(self: &Arc<Self>, address: &Address, conn_info: &str) {
        self.joined.insert(conn_info.to_string(), address.clone());

        for (from, pool) in self.nodepools() {
            if from == conn_info || pool.local().address() == address || !pool.exists(address) {
                continue;
            }
            let known = pool.channel(address).map(|ch| ch.conn_info() == conn_info).unwrap_or(false);
            if known {
                continue;
            }

            let channel = self.channel(conn_info, &from);
            if let Err(e) = pool.set_channel(address, Some(channel)) {
                warn!(node = %from, error = %e, "failed to update nodepool with joined member");
                continue;
            }
            debug!(node = %from, member = %address, conn_info, "nodepool follows joined member");
        }
    }

    fn leave(&self, address: &Address, conn_info: &str) {
        self.joined.remove(conn_info);

        for (from, pool) in self.nodepools() {
            let current = pool.channel(address).map(|ch| ch.conn_info() == conn_info).unwrap_or(false);
            if current {
                if let Err(e) = pool.set_channel(address, None) {
                    warn!(node = %from, error = %e, "failed to update nodepool with left member");
                }
            }
        }
    }

    fn nodepools(&self) -> Vec<(ConnInfo, Arc<Nodepool>)> {
        self.nodepools
            .iter()
            .filter_map(|e| e.value().upgrade().map(|p| (e.key().clone(), p)))
            .collect()
    }

    /// Channel from `from` to `to`
    pub fn channel(self: &Arc<Self>, to: &str, from: &str) -> Arc<LocalChannel> {
        Arc::new(LocalChannel {
            conn_info: to.to_string(),
            from: from.to_string(),
            network: self.clone(),
        })
    }

    /// Loader handing out channels that originate at `from`
    pub fn loader(self: &Arc<Self>, from: &str) -> Arc<dyn ChannelLoader> {
        Arc::new(LocalLoader {
            network: self.clone(),
            from: from.to_string(),
        })
    }

    fn handler(&self, conn_info: &str) -> ConsensusResult<Arc<dyn SealHandler>> {
        if self.down.contains(conn_info) {
            return Err(AgoraError::Connection(format!("{} is down", conn_info)).into());
        }
        self.handlers
            .get(conn_info)
            .and_then(|h| h.upgrade())
            .ok_or_else(|| AgoraError::Connection(format!("{} is not reachable", conn_info)).into())
    }
}

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("nodes", &self.handlers.len())
            .field("down", &self.down.len())
            .finish()
    }
}

/// Values cross the network in their wire form
fn over_wire<T: Serialize + DeserializeOwned>(value: &T) -> ConsensusResult<T> {
    let bytes = bincode::serialize(value)?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Channel to a node of the [`LocalNetwork`]
pub struct LocalChannel {
    conn_info: ConnInfo,
    from: ConnInfo,
    network: Arc<LocalNetwork>,
}

impl fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalChannel({} -> {})", self.from, self.conn_info)
    }
}

impl LocalChannel {
    /// The origin must be reachable too; a node that is down can not send
    fn handler(&self) -> ConsensusResult<Arc<dyn SealHandler>> {
        if self.network.down.contains(&self.from) {
            return Err(AgoraError::Connection(format!("{} is down", self.from)).into());
        }
        self.network.handler(&self.conn_info)
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn conn_info(&self) -> &str {
        &self.conn_info
    }

    async fn send_seal(&self, seal: &Seal) -> ConsensusResult<()> {
        let handler = self.handler()?;
        let seal = Seal::from_bytes(&seal.to_bytes()?)?;
        trace!(to = %self.conn_info, seal = %seal.hash(), "sending seal");
        handler.new_seal(seal, Some(self.from.clone())).await
    }

    async fn node_info(&self) -> ConsensusResult<NodeInfo> {
        let ni = self.handler()?.node_info().await?;
        over_wire(&ni)
    }

    async fn seals(&self, hashes: &[Hash]) -> ConsensusResult<Vec<Seal>> {
        let seals = self.handler()?.seals(hashes).await?;
        over_wire(&seals)
    }

    async fn proposal_by_hash(&self, fact_hash: &Hash) -> ConsensusResult<Option<Proposal>> {
        let proposal = self.handler()?.proposal(fact_hash).await?;
        over_wire(&proposal)
    }

    async fn blocks(&self, heights: &[Height]) -> ConsensusResult<Vec<Block>> {
        let blocks = self.handler()?.blocks(heights).await?;
        over_wire(&blocks)
    }

    async fn ping_handover(&self, seal: &HandoverSeal) -> ConsensusResult<bool> {
        self.handler()?.ping_handover(over_wire(seal)?).await
    }

    async fn end_handover(&self, seal: &HandoverSeal) -> ConsensusResult<bool> {
        self.handler()?.end_handover(over_wire(seal)?).await
    }
}

struct LocalLoader {
    network: Arc<LocalNetwork>,
    from: ConnInfo,
}

#[async_trait]
impl ChannelLoader for LocalLoader {
    async fn load(&self, conn_info: &str) -> ConsensusResult<Arc<dyn Channel>> {
        self.network.handler(conn_info)?;
        Ok(self.network.channel(conn_info, &self.from))
    }
}

/// Membership of a node in the local network's gossip set
pub struct LocalDiscovery {
    network: Arc<LocalNetwork>,
    address: Address,
    conn_info: ConnInfo,
    joined: AtomicBool,
}

impl LocalDiscovery {
    pub fn new(network: Arc<LocalNetwork>, address: Address, conn_info: impl Into<ConnInfo>) -> Self {
        Self {
            network,
            address,
            conn_info: conn_info.into(),
            joined: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Discovery for LocalDiscovery {
    async fn join(&self) -> ConsensusResult<()> {
        self.network.join(&self.address, &self.conn_info);
        self.joined.store(true, Ordering::SeqCst);
        info!(conn_info = %self.conn_info, "joined discovery");
        Ok(())
    }

    async fn leave(&self) -> ConsensusResult<()> {
        self.network.leave(&self.address, &self.conn_info);
        self.joined.store(false, Ordering::SeqCst);
        info!(conn_info = %self.conn_info, "left discovery");
        Ok(())
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }
}

/// Blocks fetched per request
const SYNC_BATCH: i64 = 10;

/// Pause after no source answered
const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(500);

struct SyncState {
    target: Height,
    sources: Vec<SyncSource>,
    finished: bool,
    running: bool,
}

struct SyncInner {
    database: Arc<MemoryDatabase>,
    network_id: NetworkId,
    state: Mutex<SyncState>,
    last: RwLock<Height>,
    when_block_saved: RwLock<Option<BlockSavedHook>>,
    when_finished: RwLock<Option<FinishedHook>>,
}

/// Fetches blocks from peer channels into a [`MemoryDatabase`]
pub struct LocalSyncers {
    inner: Arc<SyncInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSyncers {
    pub fn new(database: Arc<MemoryDatabase>, network_id: NetworkId, base: Option<Manifest>) -> Self {
        let last = base.map(|m| m.height).unwrap_or(Height::NIL);
        Self {
            inner: Arc::new(SyncInner {
                database,
                network_id,
                state: Mutex::new(SyncState {
                    target: last,
                    sources: Vec::new(),
                    finished: true,
                    running: false,
                }),
                last: RwLock::new(last),
                when_block_saved: RwLock::new(None),
                when_finished: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn target(&self) -> Height {
        self.inner.state.lock().target
    }

    pub fn last(&self) -> Height {
        *self.inner.last.read()
    }
}

#[async_trait]
impl Syncers for LocalSyncers {
    async fn add(&self, to: Height, sources: Vec<SyncSource>) -> ConsensusResult<bool> {
        let was_finished = {
            let mut state = self.inner.state.lock();
            if to <= state.target {
                return Err(ConsensusError::ignore(format!(
                    "sync target not higher; target={} to={}",
                    state.target, to
                )));
            }

            for (address, ch) in sources {
                if !state.sources.iter().any(|(a, _)| *a == address) {
                    state.sources.push((address, ch));
                }
            }
            state.target = to;

            let was_finished = state.finished;
            state.finished = false;
            if !state.running {
                state.running = true;
                let inner = self.inner.clone();
                *self.task.lock() = Some(tokio::spawn(async move { inner.run().await }));
            }
            was_finished
        };

        debug!(to = %to, was_finished, "sync target added");
        Ok(was_finished)
    }

    fn is_finished(&self) -> bool {
        self.inner.state.lock().finished
    }

    fn set_when_block_saved(&self, hook: BlockSavedHook) {
        *self.inner.when_block_saved.write() = Some(hook);
    }

    fn set_when_finished(&self, hook: FinishedHook) {
        *self.inner.when_finished.write() = Some(hook);
    }

    async fn stop(&self) -> ConsensusResult<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.state.lock().running = false;
        debug!("syncers stopped");
        Ok(())
    }
}

impl Drop for LocalSyncers {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl SyncInner {
    async fn run(self: Arc<Self>) {
        loop {
            let last = *self.last.read();
            let (target, sources) = {
                let mut state = self.state.lock();
                if last >= state.target {
                    state.finished = true;
                    state.running = false;
                    (state.target, None)
                } else {
                    (state.target, Some(state.sources.clone()))
                }
            };

            let sources = match sources {
                Some(sources) => sources,
                None => {
                    info!(height = %target, "syncing finished");
                    let hook = self.when_finished.read().clone();
                    if let Some(hook) = hook {
                        hook(target);
                    }
                    return;
                }
            };

            let to = Height(target.value().min(last.value() + SYNC_BATCH));
            let heights: Vec<Height> = (last.value() + 1..=to.value()).map(Height).collect();

            match self.fetch(&heights, &sources).await {
                Some(blocks) => {
                    let saved = self.save(blocks);
                    if saved.is_empty() {
                        tokio::time::sleep(SYNC_RETRY_INTERVAL).await;
                        continue;
                    }
                    let hook = self.when_block_saved.read().clone();
                    if let Some(hook) = hook {
                        hook(saved);
                    }
                }
                None => {
                    trace!(from = %heights[0], to = %to, "no source has the blocks yet");
                    tokio::time::sleep(SYNC_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// First non-empty answer among the sources
    async fn fetch(&self, heights: &[Height], sources: &[SyncSource]) -> Option<Vec<Block>> {
        for (address, ch) in sources {
            match ch.blocks(heights).await {
                Ok(blocks) if !blocks.is_empty() => return Some(blocks),
                Ok(_) => trace!(source = %address, "source returned no blocks"),
                Err(e) => debug!(source = %address, error = %e, "failed to fetch blocks"),
            }
        }
        None
    }

    /// Store the blocks continuing the local chain; stops at the first gap
    /// or bad block
    fn save(&self, mut blocks: Vec<Block>) -> Vec<Block> {
        blocks.sort_by_key(|b| b.manifest.height);

        let mut saved = Vec::with_capacity(blocks.len());
        for block in blocks {
            if let Err(e) = self.check(&block).and_then(|_| self.database.store_block(&block)) {
                warn!(height = %block.manifest.height, error = %e, "failed to store synced block");
                break;
            }
            *self.last.write() = block.manifest.height;
            saved.push(block);
        }
        saved
    }

    fn check(&self, block: &Block) -> agora_core::Result<()> {
        let avp = block
            .accept_voteproof
            .as_ref()
            .ok_or_else(|| AgoraError::invalid("synced block without accept voteproof"))?;
        avp.is_valid(&self.network_id)?;
        if avp.majority_accept().map(|f| f.new_block) != Some(block.hash()) {
            return Err(AgoraError::invalid("accept voteproof does not agree on synced block"));
        }
        Ok(())
    }
}

/// Builds [`LocalSyncers`] over one database
pub struct LocalSyncersFactory {
    database: Arc<MemoryDatabase>,
    network_id: NetworkId,
}

impl LocalSyncersFactory {
    pub fn new(database: Arc<MemoryDatabase>, network_id: NetworkId) -> Self {
        Self { database, network_id }
    }
}

impl SyncersFactory for LocalSyncersFactory {
    fn new_syncers(&self, base: Option<Manifest>) -> ConsensusResult<Arc<dyn Syncers>> {
        Ok(Arc::new(LocalSyncers::new(self.database.clone(), self.network_id.clone(), base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::{single_voteproof, GenesisGenerator};
    use crate::memory::block_hash;
    use agora_consensus::{Ballot, BallotFact, Database, LocalNode, Nodepool};
    use agora_core::{Address, NodeState, Round};
    use agora_crypto::PrivateKey;
    use chrono::Utc;

    fn network_id() -> NetworkId {
        NetworkId::new("test").unwrap()
    }

    fn local() -> LocalNode {
        LocalNode::new(Address::new("n0").unwrap(), PrivateKey::from_seed(&[1u8; 32]))
    }

    /// Handler serving the blocks of a database
    struct Serving {
        local: LocalNode,
        database: Arc<MemoryDatabase>,
        received: Mutex<Vec<(Seal, Option<ConnInfo>)>>,
    }

    #[async_trait]
    impl SealHandler for Serving {
        async fn new_seal(&self, seal: Seal, from: Option<ConnInfo>) -> ConsensusResult<()> {
            self.received.lock().push((seal, from));
            Ok(())
        }
        async fn node_info(&self) -> ConsensusResult<NodeInfo> {
            Ok(NodeInfo {
                address: self.local.address().clone(),
                public_key: *self.local.public_key(),
                network_id: network_id(),
                state: NodeState::Consensus,
                last_block: None,
                conn_info: "local://n0".into(),
                nodes: Vec::new(),
            })
        }
        async fn seals(&self, hashes: &[Hash]) -> ConsensusResult<Vec<Seal>> {
            Ok(self.database.seals(hashes))
        }
        async fn proposal(&self, _: &Hash) -> ConsensusResult<Option<Proposal>> {
            Ok(None)
        }
        async fn blocks(&self, heights: &[Height]) -> ConsensusResult<Vec<Block>> {
            Ok(self.database.blocks(heights))
        }
        async fn ping_handover(&self, _: HandoverSeal) -> ConsensusResult<bool> {
            Ok(true)
        }
        async fn end_handover(&self, _: HandoverSeal) -> ConsensusResult<bool> {
            Ok(true)
        }
    }

    /// Chain of `n` blocks after genesis
    async fn chain(local: &LocalNode, n: i64) -> Arc<MemoryDatabase> {
        let db = Arc::new(MemoryDatabase::new());
        GenesisGenerator::new(local.clone(), network_id())
            .generate()
            .unwrap()
            .store(&db)
            .await
            .unwrap();

        for h in 1..=n {
            let height = Height(h);
            let previous = db.block(height.prev()).unwrap();
            let ivp = single_voteproof(local, &network_id(), BallotFact::init(height, Round(0), previous.hash())).unwrap();
            let fact = BallotFact::proposal(height, Round(0), local.address().clone(), vec![], Utc::now());
            let proposal = Ballot::new(fact, Some(ivp.clone()), None, local, &network_id(), Utc::now());
            let hash = block_hash(height, Round(0), &proposal.fact().hash(), &previous.hash());
            let avp =
                single_voteproof(local, &network_id(), BallotFact::accept(height, Round(0), proposal.fact().hash(), hash))
                    .unwrap();

            db.store_block(&Block {
                manifest: Manifest {
                    height,
                    round: Round(0),
                    proposal: proposal.fact().hash(),
                    previous_block: previous.hash(),
                    hash,
                    created_at: Utc::now(),
                },
                operations: Vec::new(),
                init_voteproof: Some(ivp),
                accept_voteproof: Some(avp),
            })
            .unwrap();
        }
        db
    }

    fn serve(network: &Arc<LocalNetwork>, conn_info: &str, local: &LocalNode, database: Arc<MemoryDatabase>) -> Arc<Serving> {
        let handler = Arc::new(Serving {
            local: local.clone(),
            database,
            received: Mutex::new(Vec::new()),
        });
        let dyn_handler: Arc<dyn SealHandler> = handler.clone();
        network.register(conn_info, &dyn_handler);
        handler
    }

    #[tokio::test]
    async fn test_channel_round_trips_seal() {
        let network = LocalNetwork::new();
        let local = local();
        let db = chain(&local, 0).await;
        let handler = serve(&network, "local://n0", &local, db.clone());

        let ch = network.channel("local://n0", "local://n1");
        let ivp = single_voteproof(&local, &network_id(), BallotFact::init(Height(1), Round(0), Hash::digest(b"g"))).unwrap();
        let seal: Seal = Ballot::new(
            BallotFact::init(Height(1), Round(1), Hash::digest(b"g")),
            Some(ivp),
            None,
            &local,
            &network_id(),
            Utc::now(),
        )
        .into();

        ch.send_seal(&seal).await.unwrap();
        {
            let received = handler.received.lock();
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].0.hash(), seal.hash());
            assert_eq!(received[0].1.as_deref(), Some("local://n1"));
        }

        let info = ch.node_info().await.unwrap();
        assert_eq!(info.address, *local.address());
        assert_eq!(ch.blocks(&[Height::GENESIS, Height(7)]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_down_node_is_unreachable() {
        let network = LocalNetwork::new();
        let local = local();
        let handler = serve(&network, "local://n0", &local, chain(&local, 0).await);
        let ch = network.channel("local://n0", "local://n1");

        network.set_down("local://n0", true);
        assert!(ch.node_info().await.is_err());
        assert!(network.loader("local://n1").load("local://n0").await.is_err());

        network.set_down("local://n0", false);
        assert!(ch.node_info().await.is_ok());

        // a dropped handler is gone as well
        drop(handler);
        assert!(ch.node_info().await.is_err());
    }

    #[tokio::test]
    async fn test_discovery_membership() {
        let network = LocalNetwork::new();
        let n0 = local();
        let discovery = LocalDiscovery::new(network.clone(), n0.address().clone(), "local://n0");

        // n1 knows n0 at its first connection
        let n1 = LocalNode::new(Address::new("n1").unwrap(), PrivateKey::from_seed(&[2u8; 32]));
        let pool = Arc::new(Nodepool::new(n1));
        pool.add(n0.address().clone(), *n0.public_key(), Some(network.channel("local://n0-old", "local://n1")))
            .unwrap();
        network.register_nodepool("local://n1", &pool);

        discovery.join().await.unwrap();
        assert!(discovery.is_joined());
        assert!(network.is_joined("local://n0"));
        assert_eq!(pool.channel(n0.address()).unwrap().conn_info(), "local://n0");

        discovery.leave().await.unwrap();
        assert!(!discovery.is_joined());
        assert!(!network.is_joined("local://n0"));
        assert!(pool.channel(n0.address()).is_none());
    }

    #[tokio::test]
    async fn test_syncers_fetch_up_to_target() {
        let network = LocalNetwork::new();
        let local = local();
        let remote_db = chain(&local, 14).await;
        let _handler = serve(&network, "local://n0", &local, remote_db);

        let db = chain(&local, 0).await;
        let base = db.last_manifest().await.unwrap();
        let syncers = LocalSyncers::new(db.clone(), network_id(), base);
        assert!(syncers.is_finished());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        syncers.set_when_finished(Arc::new(move |h| {
            let _ = tx.send(h);
        }));
        let saved = Arc::new(Mutex::new(Vec::new()));
        let saved_hook = saved.clone();
        syncers.set_when_block_saved(Arc::new(move |blocks| {
            saved_hook.lock().extend(blocks.into_iter().map(|b| b.manifest.height));
        }));

        let source: SyncSource = (local.address().clone(), network.channel("local://n0", "local://n1"));
        assert!(syncers.add(Height(12), vec![source.clone()]).await.unwrap());
        assert!(syncers.add(Height(12), vec![source]).await.unwrap_err().is_ignore());

        let finished = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(finished, Height(12));
        assert!(syncers.is_finished());
        assert_eq!(db.last_height(), Height(12));
        assert_eq!(saved.lock().len(), 12);
    }
}
