//! Ballot builders shared by the states

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use agora_core::{Height, NetworkId, Round, SharedClock, Stage};
use agora_crypto::Hash;

use crate::ballot::{Ballot, BallotFact, Proposal};
use crate::database::{block_hash_at, Database};
use crate::error::{ConsensusError, ConsensusResult};
use crate::local::LocalNode;
use crate::policy::LocalPolicy;
use crate::voteproof::Voteproof;

/// Next INIT ballot after an ACCEPT voteproof
///
/// A majority moves to the next height at round 0 on top of the new block.
/// Anything else retries the same height at the next round and carries the
/// ACCEPT majority of the previous height.
pub async fn next_init_from_accept(
    database: &dyn Database,
    local: &LocalNode,
    voteproof: &Voteproof,
    network_id: &NetworkId,
    signed_at: DateTime<Utc>,
) -> ConsensusResult<Ballot> {
    if voteproof.stage != Stage::Accept {
        return Err(ConsensusError::invalid(format!(
            "next init ballot needs accept voteproof, not {}",
            voteproof.stage
        )));
    }

    if let Some(fact) = voteproof.majority_accept() {
        let init = BallotFact::init(voteproof.height.next(), Round(0), fact.new_block);
        return Ok(Ballot::new(init, Some(voteproof.clone()), None, local, network_id, signed_at));
    }

    let previous_block = block_hash_at(database, voteproof.height.prev()).await?;
    let accept = previous_accept(database, voteproof.height).await?;
    let init = BallotFact::init(voteproof.height, voteproof.round.next(), previous_block);
    Ok(Ballot::new(init, Some(voteproof.clone()), Some(accept), local, network_id, signed_at))
}

/// Next-round INIT ballot after an INIT voteproof that did not lead
/// anywhere: a draw, or a round whose proposal never came
pub async fn next_init_from_init(
    database: &dyn Database,
    local: &LocalNode,
    voteproof: &Voteproof,
    accept: Option<Voteproof>,
    network_id: &NetworkId,
    signed_at: DateTime<Utc>,
) -> ConsensusResult<Ballot> {
    if voteproof.stage != Stage::Init {
        return Err(ConsensusError::invalid(format!(
            "next round ballot needs init voteproof, not {}",
            voteproof.stage
        )));
    }

    let accept = match accept.or_else(|| voteproof.accept().cloned()) {
        Some(vp) => vp,
        None => previous_accept(database, voteproof.height).await?,
    };
    let previous_block = block_hash_at(database, voteproof.height.prev()).await?;
    let init = BallotFact::init(voteproof.height, voteproof.round.next(), previous_block);
    Ok(Ballot::new(init, Some(voteproof.clone()), Some(accept), local, network_id, signed_at))
}

async fn previous_accept(database: &dyn Database, height: Height) -> ConsensusResult<Voteproof> {
    database
        .voteproof(height.prev(), Stage::Accept)
        .await?
        .ok_or_else(|| ConsensusError::not_found(format!("accept voteproof at height {}", height.prev())))
}

/// Pending operation hashes, at most the given number
pub type OperationsSource = Arc<dyn Fn(usize) -> Vec<Hash> + Send + Sync>;

/// Builds the local proposal of a point. Asking again for the same point
/// returns the same proposal.
pub struct ProposalMaker {
    local: LocalNode,
    network_id: NetworkId,
    max_operations: usize,
    operations: OperationsSource,
    clock: SharedClock,
    last: Mutex<Option<Proposal>>,
}

impl ProposalMaker {
    pub fn new(local: LocalNode, policy: &LocalPolicy, operations: OperationsSource, clock: SharedClock) -> Self {
        Self {
            local,
            network_id: policy.network_id.clone(),
            max_operations: policy.max_operations_in_proposal,
            operations,
            clock,
            last: Mutex::new(None),
        }
    }

    /// Proposal that never carries operations
    pub fn empty(local: LocalNode, policy: &LocalPolicy, clock: SharedClock) -> Self {
        Self::new(local, policy, Arc::new(|_| Vec::new()), clock)
    }

    pub fn proposal(&self, height: Height, round: Round, init_voteproof: &Voteproof) -> Proposal {
        let mut last = self.last.lock();
        if let Some(p) = last.as_ref() {
            if p.height() == height && p.round() == round {
                return p.clone();
            }
        }

        let mut operations = (self.operations)(self.max_operations);
        operations.truncate(self.max_operations);

        let now = self.clock.now();
        let fact = BallotFact::proposal(height, round, self.local.address().clone(), operations, now);
        let proposal = Ballot::new(fact, Some(init_voteproof.clone()), None, &self.local, &self.network_id, now);

        *last = Some(proposal.clone());
        proposal
    }
}

impl std::fmt::Debug for ProposalMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalMaker")
            .field("local", self.local.address())
            .field("max_operations", &self.max_operations)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ballot::Seal;
    use crate::database::Manifest;
    use crate::test_utils::*;
    use agora_core::{Address, SystemClock};
    use async_trait::async_trait;
    use hashbrown::HashMap;

    /// Database holding manifests and voteproofs only
    #[derive(Default)]
    pub(crate) struct ChainDatabase {
        pub manifests: Mutex<HashMap<Height, Manifest>>,
        pub voteproofs: Mutex<HashMap<(Height, Stage), Voteproof>>,
        pub proposals: Mutex<HashMap<Hash, Proposal>>,
    }

    impl ChainDatabase {
        pub(crate) fn with_block(self, height: Height, hash: Hash) -> Self {
            self.manifests.lock().insert(
                height,
                Manifest {
                    height,
                    round: Round(0),
                    proposal: Hash::digest(b"proposal"),
                    previous_block: genesis_hash(),
                    hash,
                    created_at: Utc::now(),
                },
            );
            self
        }

        pub(crate) fn with_voteproof(self, vp: Voteproof) -> Self {
            self.voteproofs.lock().insert((vp.height, vp.stage), vp);
            self
        }
    }

    #[async_trait]
    impl Database for ChainDatabase {
        async fn last_manifest(&self) -> agora_core::Result<Option<Manifest>> {
            Ok(self.manifests.lock().values().max_by_key(|m| m.height).cloned())
        }
        async fn manifest_by_height(&self, height: Height) -> agora_core::Result<Option<Manifest>> {
            Ok(self.manifests.lock().get(&height).cloned())
        }
        async fn last_voteproof(&self, stage: Stage) -> agora_core::Result<Option<Voteproof>> {
            Ok(self
                .voteproofs
                .lock()
                .values()
                .filter(|vp| vp.stage == stage)
                .max_by_key(|vp| vp.stage_point())
                .cloned())
        }
        async fn voteproof(&self, height: Height, stage: Stage) -> agora_core::Result<Option<Voteproof>> {
            Ok(self.voteproofs.lock().get(&(height, stage)).cloned())
        }
        async fn new_proposal(&self, proposal: &Proposal) -> agora_core::Result<()> {
            let mut proposals = self.proposals.lock();
            if proposals.contains_key(&proposal.fact().hash()) {
                return Err(agora_core::AgoraError::Duplicated("proposal".into()));
            }
            proposals.insert(proposal.fact().hash(), proposal.clone());
            Ok(())
        }
        async fn proposal(&self, fact_hash: &Hash) -> agora_core::Result<Option<Proposal>> {
            Ok(self.proposals.lock().get(fact_hash).cloned())
        }
        async fn proposal_by_point(
            &self,
            height: Height,
            round: Round,
            proposer: &Address,
        ) -> agora_core::Result<Option<Proposal>> {
            Ok(self
                .proposals
                .lock()
                .values()
                .find(|p| p.height() == height && p.round() == round && p.node() == proposer)
                .cloned())
        }
        async fn has_seal(&self, _: &Hash) -> agora_core::Result<bool> {
            Ok(false)
        }
        async fn new_seals(&self, _: &[Seal]) -> agora_core::Result<()> {
            Ok(())
        }
        async fn check_block(&self, _: &NetworkId) -> agora_core::Result<u64> {
            let n = self.manifests.lock().len() as u64;
            if n == 0 {
                return Err(agora_core::AgoraError::not_found("no blocks"));
            }
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_init_after_accept_majority() {
        let nodes = test_nodes(3);
        let db = ChainDatabase::default();
        let avp = accept_voteproof(&nodes, Height(3), Round(2), &[0, 1, 2]);

        let ballot = next_init_from_accept(&db, &nodes[0], &avp, &network(), Utc::now()).await.unwrap();
        let fact = ballot.fact().as_init().unwrap();
        assert_eq!(fact.height, Height(4));
        assert_eq!(fact.round, Round(0));
        assert_eq!(fact.previous_block, Hash::digest(b"new-block"));
        assert!(ballot.accept_voteproof.is_none());
        assert!(ballot.is_valid(&network()).is_ok());
    }

    #[tokio::test]
    async fn test_init_after_accept_draw_retries_round() {
        let nodes = test_nodes(3);
        let prev = accept_voteproof(&nodes, Height(2), Round(0), &[0, 1, 2]);
        let db = ChainDatabase::default()
            .with_block(Height(2), Hash::digest(b"block-2"))
            .with_voteproof(prev);

        let draw = make_voteproof(&nodes, &[0, 1, 2], |i| {
            BallotFact::accept(Height(3), Round(1), Hash::digest(b"proposal"), Hash::digest(&[i as u8]))
        });
        assert!(!draw.is_majority());

        let ballot = next_init_from_accept(&db, &nodes[1], &draw, &network(), Utc::now()).await.unwrap();
        let fact = ballot.fact().as_init().unwrap();
        assert_eq!((fact.height, fact.round), (Height(3), Round(2)));
        assert_eq!(fact.previous_block, Hash::digest(b"block-2"));
        assert!(ballot.is_valid(&network()).is_ok());
    }

    #[tokio::test]
    async fn test_next_round_needs_previous_block() {
        let nodes = test_nodes(3);
        let db = ChainDatabase::default();
        let ivp = draw_init_voteproof(&nodes, Height(5), Round(0));

        let err = next_init_from_init(&db, &nodes[0], &ivp, None, &network(), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_next_round_from_init() {
        let nodes = test_nodes(3);
        let prev = accept_voteproof(&nodes, Height(4), Round(0), &[0, 1]);
        let db = ChainDatabase::default().with_block(Height(4), Hash::digest(b"block-4"));
        let ivp = draw_init_voteproof(&nodes, Height(5), Round(3));

        let ballot = next_init_from_init(&db, &nodes[2], &ivp, Some(prev), &network(), Utc::now())
            .await
            .unwrap();
        assert_eq!(ballot.round(), Round(4));
        assert_eq!(ballot.accept_voteproof.as_ref().map(|vp| vp.height), Some(Height(4)));
        assert!(ballot.is_valid(&network()).is_ok());
    }

    #[test]
    fn test_proposal_maker_reuses_proposal_of_point() {
        let nodes = test_nodes(3);
        let policy = LocalPolicy::default().with_network_id(network());
        let ops = Arc::new(|n: usize| (0..n + 5).map(|i| Hash::digest(&[i as u8])).collect());
        let maker = ProposalMaker::new(nodes[0].clone(), &policy, ops, Arc::new(SystemClock));

        let ivp = init_voteproof(&nodes, Height(1), Round(0), &[0, 1]);
        let a = maker.proposal(Height(1), Round(0), &ivp);
        let b = maker.proposal(Height(1), Round(0), &ivp);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.proposal_fact().unwrap().operations.len(), policy.max_operations_in_proposal);
        assert!(a.is_valid(&network()).is_ok());

        let ivp = init_voteproof(&nodes, Height(1), Round(1), &[0, 1]);
        let c = maker.proposal(Height(1), Round(1), &ivp);
        assert_ne!(a.fact().hash(), c.fact().hash());
    }
}
