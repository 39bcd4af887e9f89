//! Database collaborator
//!
//! The consensus core never persists anything on its own; blocks,
//! proposals, seals and voteproofs live behind this trait. Lookups that can
//! miss return `Ok(None)`. Transient storage failures surface as
//! `AgoraError::Connection` so callers can retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use agora_core::{time_bytes, Address, AgoraError, Height, NetworkId, Result, Round, Stage};
use agora_crypto::Hash;

use crate::ballot::{Proposal, Seal};
use crate::voteproof::Voteproof;

/// Block header
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub height: Height,
    pub round: Round,
    /// Fact hash of the proposal this block was built from
    pub proposal: Hash,
    pub previous_block: Hash,
    pub hash: Hash,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(160);
        b.extend_from_slice(&self.height.bytes());
        b.extend_from_slice(&self.round.bytes());
        b.extend_from_slice(self.proposal.bytes());
        b.extend_from_slice(self.previous_block.bytes());
        b.extend_from_slice(self.hash.bytes());
        b.extend_from_slice(&time_bytes(&self.created_at));
        b
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manifest({} {} {})", self.height, self.round, self.hash)
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn last_manifest(&self) -> Result<Option<Manifest>>;

    async fn manifest_by_height(&self, height: Height) -> Result<Option<Manifest>>;

    /// Durable last voteproof of `stage`
    async fn last_voteproof(&self, stage: Stage) -> Result<Option<Voteproof>>;

    async fn voteproof(&self, height: Height, stage: Stage) -> Result<Option<Voteproof>>;

    /// Store a proposal; storing the same proposal twice fails with
    /// `Duplicated`
    async fn new_proposal(&self, proposal: &Proposal) -> Result<()>;

    /// Proposal by its fact hash
    async fn proposal(&self, fact_hash: &Hash) -> Result<Option<Proposal>>;

    async fn proposal_by_point(&self, height: Height, round: Round, proposer: &Address) -> Result<Option<Proposal>>;

    async fn has_seal(&self, hash: &Hash) -> Result<bool>;

    async fn new_seals(&self, seals: &[Seal]) -> Result<()>;

    /// Validate the local chain and return the number of blocks;
    /// `NotFound` when there is no block at all
    async fn check_block(&self, network_id: &NetworkId) -> Result<u64>;
}

/// `new_proposal` treating `Duplicated` as success
pub async fn store_proposal(db: &dyn Database, proposal: &Proposal) -> Result<()> {
    match db.new_proposal(proposal).await {
        Err(e) if e.is_duplicated() => Ok(()),
        other => other,
    }
}

/// Bounded retry of a proposal lookup over transient errors
pub async fn proposal_with_retry(
    db: &dyn Database,
    fact_hash: &Hash,
    limit: Duration,
    backoff: Duration,
) -> Result<Option<Proposal>> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        match db.proposal(fact_hash).await {
            Err(e) if e.is_connection() && tokio::time::Instant::now() + backoff < deadline => {
                debug!(proposal = %fact_hash, error = %e, "proposal lookup failed; retrying");
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

/// Hash of the local block at `height`; `NotFound` when missing
pub async fn block_hash_at(db: &dyn Database, height: Height) -> Result<Hash> {
    db.manifest_by_height(height)
        .await?
        .map(|m| m.hash)
        .ok_or_else(|| AgoraError::not_found(format!("manifest at height {}", height)))
}
