//! # In-memory collaborators
//!
//! A database and a processor pool keeping everything in process memory.
//! They back single-process clusters and tests.
//!
//! ```text
//!   proposal ─► MemoryProcessorPool::new_proposal ─► prepared block
//!                          │
//!   accept vp ─► save ─────┴─► MemoryDatabase::store_block
//!                                  manifests, voteproofs
//! ```

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use agora_consensus::{
    Ballot, Block, ConsensusError, ConsensusResult, Database, Manifest, ProcessorPool, ProcessorState, Seal, Voteproof,
};
use agora_consensus::ballot::Proposal;
use agora_core::{Address, AgoraError, Height, NetworkId, Result, Round, Stage};
use agora_crypto::Hash;

/// Deterministic hash of the block built from `proposal` on top of
/// `previous_block`
pub fn block_hash(height: Height, round: Round, proposal: &Hash, previous_block: &Hash) -> Hash {
    Hash::concat(&[&height.bytes(), &round.bytes(), proposal.bytes(), previous_block.bytes()])
}

#[derive(Default)]
struct Chain {
    blocks: BTreeMap<Height, Block>,
    voteproofs: BTreeMap<(Height, Stage), Voteproof>,
}

/// Database keeping blocks, voteproofs, proposals and seals in memory
#[derive(Default)]
pub struct MemoryDatabase {
    chain: RwLock<Chain>,
    proposals: RwLock<HashMap<Hash, Proposal>>,
    seals: RwLock<HashMap<Hash, Seal>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `block` to the chain with its voteproofs. The block must
    /// follow the last stored one.
    pub fn store_block(&self, block: &Block) -> Result<()> {
        let mut chain = self.chain.write();

        let height = block.manifest.height;
        if let Some((last_height, last)) = chain.blocks.iter().next_back() {
            if height != last_height.next() {
                return Err(AgoraError::invalid(format!(
                    "block does not follow the last block; block={} last={}",
                    height, last_height
                )));
            }
            if block.manifest.previous_block != last.hash() {
                return Err(AgoraError::invalid(format!(
                    "previous block does not match; block={} previous={}",
                    height,
                    last.hash()
                )));
            }
        }

        for vp in [&block.init_voteproof, &block.accept_voteproof].into_iter().flatten() {
            if vp.height != height {
                return Err(AgoraError::invalid(format!(
                    "voteproof of other height in block; block={} voteproof={}",
                    height,
                    vp.stage_point()
                )));
            }
            chain.voteproofs.insert((vp.height, vp.stage), vp.clone());
        }
        chain.blocks.insert(height, block.clone());
        debug!(height = %height, block = %block.hash(), "block stored");
        Ok(())
    }

    pub fn block(&self, height: Height) -> Option<Block> {
        self.chain.read().blocks.get(&height).cloned()
    }

    /// Blocks at `heights`, skipping the missing ones
    pub fn blocks(&self, heights: &[Height]) -> Vec<Block> {
        let chain = self.chain.read();
        heights.iter().filter_map(|h| chain.blocks.get(h).cloned()).collect()
    }

    pub fn last_height(&self) -> Height {
        self.chain
            .read()
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Height::NIL)
    }

    pub fn seals(&self, hashes: &[Hash]) -> Vec<Seal> {
        let seals = self.seals.read();
        hashes.iter().filter_map(|h| seals.get(h).cloned()).collect()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn last_manifest(&self) -> Result<Option<Manifest>> {
        Ok(self.chain.read().blocks.values().next_back().map(|b| b.manifest.clone()))
    }

    async fn manifest_by_height(&self, height: Height) -> Result<Option<Manifest>> {
        Ok(self.chain.read().blocks.get(&height).map(|b| b.manifest.clone()))
    }

    async fn last_voteproof(&self, stage: Stage) -> Result<Option<Voteproof>> {
        Ok(self
            .chain
            .read()
            .voteproofs
            .iter()
            .filter(|((_, s), _)| *s == stage)
            .map(|(_, vp)| vp)
            .next_back()
            .cloned())
    }

    async fn voteproof(&self, height: Height, stage: Stage) -> Result<Option<Voteproof>> {
        Ok(self.chain.read().voteproofs.get(&(height, stage)).cloned())
    }

    async fn new_proposal(&self, proposal: &Proposal) -> Result<()> {
        let fact = proposal.fact().hash();
        let mut proposals = self.proposals.write();
        if proposals.contains_key(&fact) {
            return Err(AgoraError::Duplicated(format!("proposal {}", fact)));
        }
        proposals.insert(fact, proposal.clone());
        Ok(())
    }

    async fn proposal(&self, fact_hash: &Hash) -> Result<Option<Proposal>> {
        Ok(self.proposals.read().get(fact_hash).cloned())
    }

    async fn proposal_by_point(&self, height: Height, round: Round, proposer: &Address) -> Result<Option<Proposal>> {
        Ok(self
            .proposals
            .read()
            .values()
            .find(|p| p.height() == height && p.round() == round && p.node() == proposer)
            .cloned())
    }

    async fn has_seal(&self, hash: &Hash) -> Result<bool> {
        Ok(self.seals.read().contains_key(hash))
    }

    async fn new_seals(&self, seals: &[Seal]) -> Result<()> {
        let mut stored = self.seals.write();
        for seal in seals {
            stored.insert(seal.hash(), seal.clone());
        }
        Ok(())
    }

    async fn check_block(&self, network_id: &NetworkId) -> Result<u64> {
        let chain = self.chain.read();
        if chain.blocks.is_empty() {
            return Err(AgoraError::not_found("empty blocks"));
        }

        let mut previous: Option<&Block> = None;
        for block in chain.blocks.values() {
            if let Some(prev) = previous {
                if block.manifest.previous_block != prev.hash() {
                    return Err(AgoraError::invalid(format!(
                        "broken chain at height {}",
                        block.manifest.height
                    )));
                }
            }
            if let Some(vp) = &block.accept_voteproof {
                vp.is_valid(network_id)?;
                if vp.majority_accept().map(|f| f.new_block) != Some(block.hash()) {
                    return Err(AgoraError::invalid(format!(
                        "accept voteproof does not agree on block at height {}",
                        block.manifest.height
                    )));
                }
            }
            previous = Some(block);
        }
        Ok(chain.blocks.len() as u64)
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("last_height", &self.last_height())
            .field("proposals", &self.proposals.read().len())
            .field("seals", &self.seals.read().len())
            .finish()
    }
}

/// Processor pool turning proposals into blocks over a [`MemoryDatabase`]
///
/// The block hash only depends on the point, the proposal and the previous
/// block, so every node builds the same block from the same proposal.
pub struct MemoryProcessorPool {
    database: Arc<MemoryDatabase>,
    states: RwLock<HashMap<Hash, ProcessorState>>,
    prepared: RwLock<HashMap<Hash, Block>>,
    current: RwLock<Option<Hash>>,
    fail_prepare: AtomicBool,
    fail_save: AtomicBool,
}

impl MemoryProcessorPool {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self {
            database,
            states: RwLock::new(HashMap::new()),
            prepared: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            fail_prepare: AtomicBool::new(false),
            fail_save: AtomicBool::new(false),
        }
    }

    /// Make every following preparation fail
    pub fn set_fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Make every following save fail
    pub fn set_fail_save(&self, fail: bool) {
        self.fail_save.store(fail, Ordering::SeqCst);
    }

    fn set_state(&self, proposal: Hash, state: ProcessorState) {
        self.states.write().insert(proposal, state);
    }

    async fn prepare(&self, proposal: &Ballot, init_voteproof: &Voteproof) -> ConsensusResult<Block> {
        let fact = proposal
            .proposal_fact()
            .ok_or_else(|| ConsensusError::invalid("not a proposal"))?;
        let height = fact.height;

        let previous = self
            .database
            .manifest_by_height(height.prev())
            .await?
            .ok_or_else(|| ConsensusError::not_found(format!("previous block of height {}", height)))?;

        let proposal_hash = proposal.fact().hash();
        let hash = block_hash(height, fact.round, &proposal_hash, &previous.hash);

        Ok(Block {
            manifest: Manifest {
                height,
                round: fact.round,
                proposal: proposal_hash,
                previous_block: previous.hash,
                hash,
                created_at: fact.proposed_at,
            },
            operations: fact.operations.clone(),
            init_voteproof: Some(init_voteproof.clone()),
            accept_voteproof: None,
        })
    }
}

#[async_trait]
impl ProcessorPool for MemoryProcessorPool {
    async fn new_proposal(&self, proposal: &Ballot, init_voteproof: &Voteproof) -> ConsensusResult<Block> {
        let fact = proposal.fact().hash();
        if let Some(block) = self.prepared.read().get(&fact) {
            return Ok(block.clone());
        }

        self.set_state(fact, ProcessorState::Preparing);
        *self.current.write() = Some(fact);

        if self.fail_prepare.load(Ordering::SeqCst) {
            self.set_state(fact, ProcessorState::PrepareFailed);
            return Err(ConsensusError::invalid("failed to prepare proposal"));
        }

        match self.prepare(proposal, init_voteproof).await {
            Ok(block) => {
                self.prepared.write().insert(fact, block.clone());
                self.set_state(fact, ProcessorState::Prepared);
                Ok(block)
            }
            Err(e) => {
                self.set_state(fact, ProcessorState::PrepareFailed);
                Err(e)
            }
        }
    }

    async fn save(&self, proposal: &Hash, accept_voteproof: &Voteproof) -> ConsensusResult<Block> {
        let mut block = self
            .prepared
            .read()
            .get(proposal)
            .cloned()
            .ok_or_else(|| ConsensusError::not_found(format!("prepared block of proposal {}", proposal)))?;

        if accept_voteproof.majority_accept().map(|f| f.new_block) != Some(block.hash()) {
            self.set_state(*proposal, ProcessorState::SaveFailed);
            return Err(ConsensusError::invalid("accept voteproof agreed on other block"));
        }

        self.set_state(*proposal, ProcessorState::Saving);
        if self.fail_save.load(Ordering::SeqCst) {
            self.set_state(*proposal, ProcessorState::SaveFailed);
            return Err(ConsensusError::invalid("failed to save block"));
        }

        block.accept_voteproof = Some(accept_voteproof.clone());
        if let Err(e) = self.database.store_block(&block) {
            self.set_state(*proposal, ProcessorState::SaveFailed);
            return Err(e.into());
        }

        self.set_state(*proposal, ProcessorState::Saved);
        self.prepared.write().retain(|_, b| b.manifest.height > block.manifest.height);
        *self.current.write() = None;
        info!(height = %block.manifest.height, block = %block.hash(), "block saved");
        Ok(block)
    }

    fn current_state(&self, proposal: &Hash) -> ProcessorState {
        self.states.read().get(proposal).copied().unwrap_or_default()
    }

    fn current(&self) -> Option<Hash> {
        *self.current.read()
    }
}
