//! Genesis block generation
//!
//! The genesis block is agreed by the generating node alone: its INIT and
//! ACCEPT voteproofs carry a single vote under a 100% threshold. Every
//! member of a new network stores the same genesis block before booting.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use agora_consensus::ballot::Proposal;
use agora_consensus::{Ballot, BallotFact, Block, ConsensusResult, Database, LocalNode, Manifest, Voteproof, VoteproofNodeFact};
use agora_core::{Height, NetworkId, Round, Threshold, ThresholdRatio, VoteResult};
use agora_crypto::Hash;

use crate::memory::{block_hash, MemoryDatabase};

/// Genesis block and the proposal it was built from
#[derive(Clone, Debug)]
pub struct Genesis {
    pub block: Block,
    pub proposal: Proposal,
}

impl Genesis {
    pub fn hash(&self) -> Hash {
        self.block.hash()
    }

    /// Store the genesis proposal and block into an empty database
    pub async fn store(&self, database: &MemoryDatabase) -> ConsensusResult<()> {
        agora_consensus::database::store_proposal(database, &self.proposal).await?;
        database.store_block(&self.block)?;
        Ok(())
    }
}

/// Builds the genesis block of a network
pub struct GenesisGenerator {
    local: LocalNode,
    network_id: NetworkId,
    operations: Vec<Hash>,
    created_at: DateTime<Utc>,
}

impl GenesisGenerator {
    pub fn new(local: LocalNode, network_id: NetworkId) -> Self {
        Self {
            local,
            network_id,
            operations: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Operations of the genesis proposal
    pub fn with_operations(mut self, operations: Vec<Hash>) -> Self {
        self.operations = operations;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn generate(&self) -> ConsensusResult<Genesis> {
        let height = Height::GENESIS;
        let round = Round(0);
        let previous_block = Hash::digest(self.network_id.as_bytes());

        let init_voteproof = single_voteproof_at(
            &self.local,
            &self.network_id,
            BallotFact::init(height, round, previous_block),
            self.created_at,
        )?;

        let proposal = Ballot::new(
            BallotFact::proposal(
                height,
                round,
                self.local.address().clone(),
                self.operations.clone(),
                self.created_at,
            ),
            Some(init_voteproof.clone()),
            None,
            &self.local,
            &self.network_id,
            self.created_at,
        );
        let proposal_hash = proposal.fact().hash();
        let hash = block_hash(height, round, &proposal_hash, &previous_block);

        let accept_voteproof = single_voteproof_at(
            &self.local,
            &self.network_id,
            BallotFact::accept(height, round, proposal_hash, hash),
            self.created_at,
        )?;

        let block = Block {
            manifest: Manifest {
                height,
                round,
                proposal: proposal_hash,
                previous_block,
                hash,
                created_at: self.created_at,
            },
            operations: self.operations.clone(),
            init_voteproof: Some(init_voteproof),
            accept_voteproof: Some(accept_voteproof),
        };
        tracing::info!(block = %hash, network_id = %self.network_id, "genesis block generated");

        Ok(Genesis { block, proposal })
    }
}

/// Majority voteproof of `fact` voted by `local` alone
pub fn single_voteproof(local: &LocalNode, network_id: &NetworkId, fact: BallotFact) -> ConsensusResult<Voteproof> {
    single_voteproof_at(local, network_id, fact, Utc::now())
}

fn single_voteproof_at(
    local: &LocalNode,
    network_id: &NetworkId,
    fact: BallotFact,
    signed_at: DateTime<Utc>,
) -> ConsensusResult<Voteproof> {
    let ballot = Ballot::new(fact.clone(), None, None, local, network_id, signed_at);
    let sign = ballot.fact_sign().clone();

    let mut votes = BTreeMap::new();
    votes.insert(
        local.address().clone(),
        VoteproofNodeFact {
            address: local.address().clone(),
            ballot: ballot.hash(),
            fact: fact.hash(),
            fact_signature: sign.signature,
            signer: sign.signer,
            signed_at: sign.signed_at,
        },
    );

    let threshold = Threshold::new(1, ThresholdRatio::new(100.0)?)?;
    let voteproof = Voteproof::new(
        fact.stage_point(),
        vec![local.address().clone()],
        threshold,
        VoteResult::Majority,
        Some(fact.clone()),
        vec![fact],
        votes,
        signed_at,
    );
    voteproof.is_valid(network_id)?;
    Ok(voteproof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::{Address, Stage};
    use agora_crypto::PrivateKey;

    fn generator() -> GenesisGenerator {
        let local = LocalNode::new(Address::new("n0").unwrap(), PrivateKey::from_seed(&[1u8; 32]));
        GenesisGenerator::new(local, NetworkId::new("test").unwrap())
    }

    #[test]
    fn test_genesis_voteproofs() {
        let genesis = generator().with_operations(vec![Hash::digest(b"policy")]).generate().unwrap();
        let block = &genesis.block;

        assert_eq!(block.manifest.height, Height::GENESIS);
        assert_eq!(block.operations.len(), 1);

        let ivp = block.init_voteproof.as_ref().unwrap();
        let avp = block.accept_voteproof.as_ref().unwrap();
        assert_eq!((ivp.stage, avp.stage), (Stage::Init, Stage::Accept));
        assert!(avp.is_majority());
        assert_eq!(avp.threshold.total, 1);
        assert_eq!(avp.majority_accept().unwrap().new_block, block.hash());
        assert_eq!(avp.majority_accept().unwrap().proposal, genesis.proposal.fact().hash());
    }

    #[test]
    fn test_same_input_same_block() {
        let at = Utc::now();
        let a = generator().with_created_at(at).generate().unwrap();
        let b = generator().with_created_at(at).generate().unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[tokio::test]
    async fn test_store_into_database() {
        let genesis = generator().generate().unwrap();
        let db = MemoryDatabase::new();

        genesis.store(&db).await.unwrap();
        assert_eq!(db.check_block(&NetworkId::new("test").unwrap()).await.unwrap(), 1);
        assert!(db.proposal(&genesis.proposal.fact().hash()).await.unwrap().is_some());
    }
}
