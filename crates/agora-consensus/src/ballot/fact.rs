//! Ballot facts
//!
//! A fact is what nodes actually vote on. Its hash is the BLAKE3 digest of
//! its deterministic byte form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agora_core::{time_bytes, Address, AgoraError, Height, Point, Result, Round, Stage, StagePoint};
use agora_crypto::Hash;

/// INIT fact: opens a round on top of `previous_block`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitFact {
    pub height: Height,
    pub round: Round,
    pub previous_block: Hash,
}

/// Proposal fact: the block body proposed for a round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalFact {
    pub height: Height,
    pub round: Round,
    pub proposer: Address,
    pub operations: Vec<Hash>,
    pub proposed_at: DateTime<Utc>,
}

/// ACCEPT fact: agreement on the block built from a proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptFact {
    pub height: Height,
    pub round: Round,
    pub proposal: Hash,
    pub new_block: Hash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BallotFact {
    Init(InitFact),
    Proposal(ProposalFact),
    Accept(AcceptFact),
}

impl BallotFact {
    pub fn init(height: Height, round: Round, previous_block: Hash) -> Self {
        BallotFact::Init(InitFact {
            height,
            round,
            previous_block,
        })
    }

    pub fn accept(height: Height, round: Round, proposal: Hash, new_block: Hash) -> Self {
        BallotFact::Accept(AcceptFact {
            height,
            round,
            proposal,
            new_block,
        })
    }

    pub fn proposal(
        height: Height,
        round: Round,
        proposer: Address,
        operations: Vec<Hash>,
        proposed_at: DateTime<Utc>,
    ) -> Self {
        BallotFact::Proposal(ProposalFact {
            height,
            round,
            proposer,
            operations,
            proposed_at,
        })
    }

    pub fn stage(&self) -> Stage {
        match self {
            BallotFact::Init(_) => Stage::Init,
            BallotFact::Proposal(_) => Stage::Proposal,
            BallotFact::Accept(_) => Stage::Accept,
        }
    }

    pub fn height(&self) -> Height {
        match self {
            BallotFact::Init(f) => f.height,
            BallotFact::Proposal(f) => f.height,
            BallotFact::Accept(f) => f.height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            BallotFact::Init(f) => f.round,
            BallotFact::Proposal(f) => f.round,
            BallotFact::Accept(f) => f.round,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.height(), self.round())
    }

    pub fn stage_point(&self) -> StagePoint {
        StagePoint::new(self.height(), self.round(), self.stage())
    }

    pub fn as_init(&self) -> Option<&InitFact> {
        match self {
            BallotFact::Init(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_proposal(&self) -> Option<&ProposalFact> {
        match self {
            BallotFact::Proposal(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_accept(&self) -> Option<&AcceptFact> {
        match self {
            BallotFact::Accept(f) => Some(f),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(128);
        b.extend_from_slice(&self.stage().bytes());
        b.extend_from_slice(&self.height().bytes());
        b.extend_from_slice(&self.round().bytes());

        match self {
            BallotFact::Init(f) => b.extend_from_slice(f.previous_block.bytes()),
            BallotFact::Proposal(f) => {
                b.extend_from_slice(f.proposer.bytes());
                for op in &f.operations {
                    b.extend_from_slice(op.bytes());
                }
                b.extend_from_slice(&time_bytes(&f.proposed_at));
            }
            BallotFact::Accept(f) => {
                b.extend_from_slice(f.proposal.bytes());
                b.extend_from_slice(f.new_block.bytes());
            }
        }
        b
    }

    pub fn hash(&self) -> Hash {
        Hash::digest(&self.bytes())
    }

    pub fn is_valid(&self) -> Result<()> {
        self.height().is_valid()?;

        match self {
            BallotFact::Init(f) => {
                if f.previous_block.is_zero() {
                    return Err(AgoraError::invalid("empty previous block of init fact"));
                }
            }
            BallotFact::Proposal(f) => {
                f.proposer.is_valid()?;
                if agora_core::is_zero_time(&f.proposed_at) {
                    return Err(AgoraError::invalid("empty proposed_at of proposal fact"));
                }
                let mut seen = std::collections::HashSet::with_capacity(f.operations.len());
                if !f.operations.iter().all(|op| seen.insert(*op)) {
                    return Err(AgoraError::invalid("duplicated operations in proposal fact"));
                }
            }
            BallotFact::Accept(f) => {
                if f.proposal.is_zero() || f.new_block.is_zero() {
                    return Err(AgoraError::invalid("empty proposal or new block of accept fact"));
                }
            }
        }
        Ok(())
    }
}
