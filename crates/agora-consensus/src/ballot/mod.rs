//! Ballots
//!
//! A ballot is the transport envelope of a signed fact. Besides the fact it
//! carries the voteproofs of the preceding point, which chain rounds
//! together and let a receiver that fell behind notice it.
//!
//! | Stage    | base voteproof                 | accept voteproof          |
//! |----------|--------------------------------|---------------------------|
//! | INIT     | ACCEPT majority at `h-1`       | none                      |
//! | INIT     | ACCEPT draw / INIT at `h`      | ACCEPT majority at `h-1`  |
//! | PROPOSAL | INIT at the same point         | none                      |
//! | ACCEPT   | INIT at the same point         | none                      |

pub mod fact;
pub mod seal;
pub mod sign;

pub use fact::{AcceptFact, BallotFact, InitFact, ProposalFact};
pub use seal::{HandoverSeal, HandoverSealKind, Seal, SealSign};
pub use sign::{fact_signing_bytes, BallotFactSign, SignedBallotFact};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agora_core::{time_bytes, Address, AgoraError, Height, NetworkId, Point, Result, Round, Stage, StagePoint, VoteResult};
use agora_crypto::Hash;

use crate::local::LocalNode;
use crate::voteproof::Voteproof;

/// Proposals travel as ballots carrying a proposal fact
pub type Proposal = Ballot;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub signed_fact: SignedBallotFact,
    pub base_voteproof: Option<Voteproof>,
    pub accept_voteproof: Option<Voteproof>,
    pub seal: SealSign,
}

impl Ballot {
    pub fn new(
        fact: BallotFact,
        base_voteproof: Option<Voteproof>,
        accept_voteproof: Option<Voteproof>,
        local: &LocalNode,
        network_id: &NetworkId,
        signed_at: DateTime<Utc>,
    ) -> Self {
        let signed_fact = SignedBallotFact::new(fact, local.address().clone(), local.private_key(), network_id, signed_at);
        let body_hash = Self::body_hash_of(&signed_fact, &base_voteproof, &accept_voteproof, &signed_at);
        let seal = SealSign::sign(&body_hash, local, network_id, signed_at);

        Self {
            signed_fact,
            base_voteproof,
            accept_voteproof,
            seal,
        }
    }

    /// Refresh both signatures with a new `signed_at`
    pub fn resign(&mut self, local: &LocalNode, network_id: &NetworkId, signed_at: DateTime<Utc>) {
        *self = Self::new(
            self.signed_fact.fact.clone(),
            self.base_voteproof.take(),
            self.accept_voteproof.take(),
            local,
            network_id,
            signed_at,
        );
    }

    fn body_hash_of(
        signed_fact: &SignedBallotFact,
        base: &Option<Voteproof>,
        accept: &Option<Voteproof>,
        signed_at: &DateTime<Utc>,
    ) -> Hash {
        let base = base.as_ref().map(Voteproof::bytes).unwrap_or_default();
        let accept = accept.as_ref().map(Voteproof::bytes).unwrap_or_default();
        Hash::concat(&[&signed_fact.bytes(), &base, &accept, &time_bytes(signed_at)])
    }

    pub fn body_hash(&self) -> Hash {
        Self::body_hash_of(&self.signed_fact, &self.base_voteproof, &self.accept_voteproof, &self.seal.signed_at)
    }

    pub fn hash(&self) -> Hash {
        self.seal.hash(&self.body_hash())
    }

    pub fn fact(&self) -> &BallotFact {
        &self.signed_fact.fact
    }

    pub fn fact_sign(&self) -> &BallotFactSign {
        &self.signed_fact.sign
    }

    pub fn node(&self) -> &Address {
        &self.signed_fact.sign.node
    }

    pub fn stage(&self) -> Stage {
        self.fact().stage()
    }

    pub fn height(&self) -> Height {
        self.fact().height()
    }

    pub fn round(&self) -> Round {
        self.fact().round()
    }

    pub fn point(&self) -> Point {
        self.fact().point()
    }

    pub fn stage_point(&self) -> StagePoint {
        self.fact().stage_point()
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.seal.signed_at
    }

    pub fn proposal_fact(&self) -> Option<&ProposalFact> {
        self.fact().as_proposal()
    }

    /// The voteproof this ballot proves: the base voteproof, with the
    /// accept voteproof attached when the ballot carries one
    pub fn carried_voteproof(&self) -> Option<Voteproof> {
        let base = self.base_voteproof.clone()?;
        Some(match &self.accept_voteproof {
            Some(accept) => base.with_accept(accept.clone()),
            None => base,
        })
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        self.seal.is_valid(&self.body_hash(), network_id)?;
        if self.seal.signer != self.signed_fact.sign.signer {
            return Err(AgoraError::invalid("seal signer does not match fact signer"));
        }
        self.signed_fact.is_valid(network_id)?;

        if let Some(vp) = &self.base_voteproof {
            vp.is_valid(network_id)?;
        }
        if let Some(vp) = &self.accept_voteproof {
            vp.is_valid(network_id)?;
        }

        match self.stage() {
            Stage::Init => self.check_init_voteproofs(),
            Stage::Proposal | Stage::Accept => self.check_base_is_same_init(),
            Stage::Sign => Err(AgoraError::invalid("sign stage ballot is not supported")),
        }
    }

    fn check_init_voteproofs(&self) -> Result<()> {
        let fact = self.fact();
        let base = match &self.base_voteproof {
            Some(vp) => vp,
            None if fact.height() <= Height::GENESIS => return Ok(()),
            None => return Err(AgoraError::invalid("init ballot without base voteproof")),
        };

        match (base.stage, base.result) {
            (Stage::Accept, VoteResult::Majority) => {
                if self.accept_voteproof.is_some() {
                    return Err(AgoraError::invalid("init ballot after accept majority carries accept voteproof"));
                }
                if fact.height() != base.height.next() {
                    return Err(AgoraError::invalid(format!(
                        "init ballot height should follow accept voteproof; ballot={} voteproof={}",
                        fact.height(),
                        base.height
                    )));
                }
                if fact.round() != Round(0) {
                    return Err(AgoraError::invalid("init ballot after accept majority should start round 0"));
                }
                return Ok(());
            }
            (Stage::Accept, _) | (Stage::Init, _) => {
                if fact.height() != base.height {
                    return Err(AgoraError::invalid("init ballot for next round should keep height"));
                }
                if fact.round() != base.round.next() {
                    return Err(AgoraError::invalid(format!(
                        "init ballot round should follow base voteproof; ballot={} voteproof={}",
                        fact.round(),
                        base.round
                    )));
                }
            }
            (stage, _) => {
                return Err(AgoraError::invalid(format!("invalid base voteproof stage, {}", stage)));
            }
        }

        let accept = match &self.accept_voteproof {
            Some(vp) => vp,
            None => return Err(AgoraError::invalid("init ballot for next round without accept voteproof")),
        };
        if accept.stage != Stage::Accept || accept.result != VoteResult::Majority {
            return Err(AgoraError::invalid("accept voteproof of init ballot should be accept majority"));
        }
        if accept.height != fact.height().prev() {
            return Err(AgoraError::invalid(format!(
                "accept voteproof height should be previous height; ballot={} voteproof={}",
                fact.height(),
                accept.height
            )));
        }
        Ok(())
    }

    fn check_base_is_same_init(&self) -> Result<()> {
        let base = self
            .base_voteproof
            .as_ref()
            .ok_or_else(|| AgoraError::invalid(format!("{} ballot without base voteproof", self.stage())))?;

        if base.stage != Stage::Init {
            return Err(AgoraError::invalid(format!("{} ballot should carry init voteproof", self.stage())));
        }
        if base.point() != self.point() {
            return Err(AgoraError::invalid(format!(
                "{} ballot point does not match init voteproof; ballot={} voteproof={}",
                self.stage(),
                self.point(),
                base.point()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_init_after_accept_majority() {
        let nodes = test_nodes(3);
        let avp = accept_voteproof(&nodes, Height(3), Round(2), &[0, 1]);

        let ok = sign_ballot(&nodes[0], BallotFact::init(Height(4), Round(0), genesis_hash()), Some(avp.clone()), None);
        assert!(ok.is_valid(&network()).is_ok());

        let wrong_round = sign_ballot(&nodes[0], BallotFact::init(Height(4), Round(1), genesis_hash()), Some(avp.clone()), None);
        assert!(wrong_round.is_valid(&network()).is_err());

        let with_accept = sign_ballot(
            &nodes[0],
            BallotFact::init(Height(4), Round(0), genesis_hash()),
            Some(avp.clone()),
            Some(avp),
        );
        assert!(with_accept.is_valid(&network()).is_err());
    }

    #[test]
    fn test_init_next_round_needs_accept() {
        let nodes = test_nodes(3);
        let base = draw_init_voteproof(&nodes, Height(4), Round(0));
        let avp = accept_voteproof(&nodes, Height(3), Round(0), &[0, 1]);

        let ok = sign_ballot(
            &nodes[1],
            BallotFact::init(Height(4), Round(1), genesis_hash()),
            Some(base.clone()),
            Some(avp.clone()),
        );
        assert!(ok.is_valid(&network()).is_ok());

        let missing = sign_ballot(&nodes[1], BallotFact::init(Height(4), Round(1), genesis_hash()), Some(base.clone()), None);
        assert!(missing.is_valid(&network()).is_err());

        let stale_accept = accept_voteproof(&nodes, Height(2), Round(0), &[0, 1]);
        let stale = sign_ballot(
            &nodes[1],
            BallotFact::init(Height(4), Round(1), genesis_hash()),
            Some(base),
            Some(stale_accept),
        );
        assert!(stale.is_valid(&network()).is_err());
    }

    #[test]
    fn test_accept_ballot_needs_same_init_point() {
        let nodes = test_nodes(3);
        let ivp = init_voteproof(&nodes, Height(5), Round(0), &[0, 1]);
        let fact = BallotFact::accept(Height(5), Round(0), Hash::digest(b"p"), Hash::digest(b"b"));

        let ok = sign_ballot(&nodes[2], fact.clone(), Some(ivp), None);
        assert!(ok.is_valid(&network()).is_ok());

        let other = init_voteproof(&nodes, Height(5), Round(1), &[0, 1]);
        let bad = sign_ballot(&nodes[2], fact, Some(other), None);
        assert!(bad.is_valid(&network()).is_err());
    }

    #[test]
    fn test_resign_refreshes_signed_at() {
        let nodes = test_nodes(1);
        let mut b = sign_ballot(&nodes[0], BallotFact::init(Height(0), Round(0), genesis_hash()), None, None);
        let before = b.hash();
        let later = b.signed_at() + chrono::Duration::seconds(5);

        b.resign(&nodes[0], &network(), later);
        assert_eq!(b.signed_at(), later);
        assert_ne!(b.hash(), before);
        assert!(b.is_valid(&network()).is_ok());
    }

    #[test]
    fn test_ballot_wire_form() {
        let nodes = test_nodes(3);
        let ivp = init_voteproof(&nodes, Height(5), Round(0), &[0, 1]);
        let b = sign_ballot(
            &nodes[2],
            BallotFact::accept(Height(5), Round(0), Hash::digest(b"p"), Hash::digest(b"b")),
            Some(ivp),
            None,
        );
        let seal = Seal::Ballot(b);

        let decoded = Seal::from_bytes(&seal.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.hash(), seal.hash());
        assert!(decoded.is_valid(&network()).is_ok());
    }
}
