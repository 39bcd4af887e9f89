//! Processor pool collaborator
//!
//! Turns a proposal into a block and commits it. The core drives the
//! pipeline without interpreting operations.
//!
//! ```text
//!   BeforePrepared ─► Preparing ─► Prepared ─► Saving ─► Saved
//!                        │                       │
//!                        ▼                       ▼
//!                  PrepareFailed             SaveFailed
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use agora_crypto::Hash;

use crate::ballot::Ballot;
use crate::database::Manifest;
use crate::error::ConsensusResult;
use crate::voteproof::Voteproof;

/// Prefix of the block hash used when a proposal fails to process
pub const PROCESS_PROPOSAL_FAILED_PREFIX: &str = "processproposalfailed";

/// Deterministic block hash voted when processing `proposal` failed
pub fn failed_block_hash(proposal: &Hash) -> Hash {
    Hash::with_prefix(PROCESS_PROPOSAL_FAILED_PREFIX, proposal)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessorState {
    #[default]
    BeforePrepared,
    Preparing,
    Prepared,
    PrepareFailed,
    Saving,
    Saved,
    SaveFailed,
    Canceled,
}

impl ProcessorState {
    /// The proposal went through preparation, or is on its way
    pub fn is_processed(&self) -> bool {
        matches!(
            self,
            ProcessorState::Preparing | ProcessorState::Prepared | ProcessorState::Saving | ProcessorState::Saved
        )
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorState::BeforePrepared => "before-prepared",
            ProcessorState::Preparing => "preparing",
            ProcessorState::Prepared => "prepared",
            ProcessorState::PrepareFailed => "prepare-failed",
            ProcessorState::Saving => "saving",
            ProcessorState::Saved => "saved",
            ProcessorState::SaveFailed => "save-failed",
            ProcessorState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Block built from a proposal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub manifest: Manifest,
    pub operations: Vec<Hash>,
    pub init_voteproof: Option<Voteproof>,
    pub accept_voteproof: Option<Voteproof>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.manifest.hash
    }
}

#[async_trait]
pub trait ProcessorPool: Send + Sync {
    /// Prepare the block of `proposal` under the INIT voteproof
    async fn new_proposal(&self, proposal: &Ballot, init_voteproof: &Voteproof) -> ConsensusResult<Block>;

    /// Commit the prepared block of `proposal`; not bounded by a timeout
    async fn save(&self, proposal: &Hash, accept_voteproof: &Voteproof) -> ConsensusResult<Block>;

    fn current_state(&self, proposal: &Hash) -> ProcessorState;

    /// Fact hash of the proposal being processed, if any
    fn current(&self) -> Option<Hash>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_states() {
        assert!(ProcessorState::Prepared.is_processed());
        assert!(ProcessorState::Saved.is_processed());
        assert!(!ProcessorState::BeforePrepared.is_processed());
        assert!(!ProcessorState::PrepareFailed.is_processed());
    }

    #[test]
    fn test_failed_block_hash_is_deterministic() {
        let p = Hash::digest(b"proposal");
        assert_eq!(failed_block_hash(&p), failed_block_hash(&p));
        assert_ne!(failed_block_hash(&p), p);
    }
}
