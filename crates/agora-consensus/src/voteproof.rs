//! Voteproofs
//!
//! A voteproof proves that a threshold of the acting suffrage voted the
//! same fact at a point (Majority), or that no fact can reach the threshold
//! any more (Draw).
//!
//! ## Byte Form
//!
//! ```text
//!   height || round || threshold || result || stage || majority
//!     || sorted(ballots) || sorted(facts) || sorted(votes) || finished_at
//! ```
//!
//! Map-backed collections are sorted by key bytes. Two nodes building the
//! same voteproof produce identical bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use agora_core::{
    find_majority, is_zero_time, time_bytes, Address, AgoraError, Height, MajorityResult, NetworkId, Point, Result, Round,
    Stage, StagePoint, Threshold, VoteResult,
};
use agora_crypto::{Hash, PublicKey, Signature};

use crate::ballot::{fact_signing_bytes, AcceptFact, BallotFact, InitFact};

/// One voter's vote as recorded in a voteproof
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteproofNodeFact {
    pub address: Address,
    pub ballot: Hash,
    pub fact: Hash,
    pub fact_signature: Signature,
    pub signer: PublicKey,
    pub signed_at: DateTime<Utc>,
}

impl VoteproofNodeFact {
    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(192);
        b.extend_from_slice(self.address.bytes());
        b.extend_from_slice(self.ballot.bytes());
        b.extend_from_slice(self.fact.bytes());
        b.extend_from_slice(self.fact_signature.bytes());
        b.extend_from_slice(self.signer.bytes());
        b.extend_from_slice(&time_bytes(&self.signed_at));
        b
    }

    pub fn verify(&self, network_id: &NetworkId) -> Result<()> {
        self.signer
            .verify(&fact_signing_bytes(&self.fact, &self.signed_at, network_id), &self.fact_signature)
            .map_err(|e| AgoraError::SignatureVerificationFailed(format!("vote of {}: {}", self.address, e)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Voteproof {
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
    pub suffrages: Vec<Address>,
    pub threshold: Threshold,
    pub result: VoteResult,
    pub closed: bool,
    pub majority: Option<BallotFact>,
    pub facts: Vec<BallotFact>,
    pub ballots: BTreeMap<Address, Hash>,
    pub votes: BTreeMap<Address, VoteproofNodeFact>,
    pub finished_at: DateTime<Utc>,

    /// ACCEPT voteproof travelling with an INIT voteproof of a later round;
    /// not part of the byte form
    #[serde(skip)]
    accept: Option<Box<Voteproof>>,
}

impl Voteproof {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        point: StagePoint,
        suffrages: Vec<Address>,
        threshold: Threshold,
        result: VoteResult,
        majority: Option<BallotFact>,
        mut facts: Vec<BallotFact>,
        votes: BTreeMap<Address, VoteproofNodeFact>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        facts.sort_by_key(|f| f.hash());
        let ballots = votes.iter().map(|(a, v)| (a.clone(), v.ballot)).collect();

        Self {
            height: point.height(),
            round: point.round(),
            stage: point.stage,
            suffrages,
            threshold,
            result,
            closed: true,
            majority,
            facts,
            ballots,
            votes,
            finished_at,
            accept: None,
        }
    }

    /// Attach the ACCEPT voteproof of the previous height
    pub fn with_accept(mut self, accept: Voteproof) -> Self {
        self.accept = Some(Box::new(accept));
        self
    }

    pub fn accept(&self) -> Option<&Voteproof> {
        self.accept.as_deref()
    }

    pub fn point(&self) -> Point {
        Point::new(self.height, self.round)
    }

    pub fn stage_point(&self) -> StagePoint {
        StagePoint::new(self.height, self.round, self.stage)
    }

    pub fn id(&self) -> String {
        format!("{}-{}-{}-{}", self.height, self.round, self.stage, self.finished_at.timestamp_nanos_opt().unwrap_or(0))
    }

    pub fn is_majority(&self) -> bool {
        self.result == VoteResult::Majority
    }

    pub fn majority_init(&self) -> Option<&InitFact> {
        self.majority.as_ref().and_then(BallotFact::as_init)
    }

    pub fn majority_accept(&self) -> Option<&AcceptFact> {
        self.majority.as_ref().and_then(BallotFact::as_accept)
    }

    /// Voters other than `local`
    pub fn voters_except(&self, local: &Address) -> Vec<Address> {
        self.votes.keys().filter(|a| *a != local).cloned().collect()
    }

    /// Voters of the fact with `fact_hash`
    pub fn voters_of(&self, fact_hash: &Hash) -> Vec<Address> {
        self.votes
            .values()
            .filter(|v| v.fact == *fact_hash)
            .map(|v| v.address.clone())
            .collect()
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(1024);
        b.extend_from_slice(&self.height.bytes());
        b.extend_from_slice(&self.round.bytes());
        b.extend_from_slice(&self.threshold.bytes());
        b.extend_from_slice(&self.result.bytes());
        b.extend_from_slice(&self.stage.bytes());
        if let Some(m) = &self.majority {
            b.extend_from_slice(&m.bytes());
        }

        for (address, ballot) in &self.ballots {
            b.extend_from_slice(address.bytes());
            b.extend_from_slice(ballot.bytes());
        }

        let mut facts: Vec<(Hash, Vec<u8>)> = self.facts.iter().map(|f| (f.hash(), f.bytes())).collect();
        facts.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, fb) in facts {
            b.extend_from_slice(&fb);
        }

        for vote in self.votes.values() {
            b.extend_from_slice(&vote.bytes());
        }

        b.extend_from_slice(&time_bytes(&self.finished_at));
        b
    }

    pub fn hash(&self) -> Hash {
        Hash::digest(&self.bytes())
    }

    pub fn is_valid(&self, network_id: &NetworkId) -> Result<()> {
        self.height.is_valid()?;
        self.threshold.is_valid()?;

        if !self.stage.can_vote() {
            return Err(AgoraError::invalid(format!("voteproof of non-voting stage, {}", self.stage)));
        }
        if is_zero_time(&self.finished_at) {
            return Err(AgoraError::invalid("voteproof without finished_at"));
        }

        match (self.result, &self.majority) {
            (VoteResult::NotYet, _) => return Err(AgoraError::invalid("voteproof not yet finished")),
            (VoteResult::Majority, None) => return Err(AgoraError::invalid("majority voteproof without majority fact")),
            (VoteResult::Draw, Some(_)) => return Err(AgoraError::invalid("draw voteproof with majority fact")),
            _ => {}
        }

        if self.facts.is_empty() || self.ballots.is_empty() || self.votes.is_empty() {
            return Err(AgoraError::invalid("voteproof with empty facts, ballots or votes"));
        }
        if self.votes.len() as u64 > self.threshold.total {
            return Err(AgoraError::invalid("voteproof has more votes than total"));
        }

        let mut fact_hashes = Vec::with_capacity(self.facts.len());
        let mut seen = HashSet::with_capacity(self.facts.len());
        for fact in &self.facts {
            fact.is_valid()?;
            if fact.stage_point() != self.stage_point() {
                return Err(AgoraError::invalid(format!(
                    "fact point does not match voteproof; fact={} voteproof={}",
                    fact.stage_point(),
                    self.stage_point()
                )));
            }
            let h = fact.hash();
            if !seen.insert(h) {
                return Err(AgoraError::invalid("duplicated fact in voteproof"));
            }
            fact_hashes.push(h);
        }

        if self.ballots.len() != self.votes.len() {
            return Err(AgoraError::invalid("ballots and votes of voteproof do not match"));
        }

        let mut counts = vec![0u64; fact_hashes.len()];
        for (address, vote) in &self.votes {
            if vote.address != *address {
                return Err(AgoraError::invalid(format!("vote keyed by other address, {}", address)));
            }
            if self.ballots.get(address) != Some(&vote.ballot) {
                return Err(AgoraError::invalid(format!("ballot of voter does not match, {}", address)));
            }
            if !self.suffrages.contains(address) {
                return Err(AgoraError::invalid(format!("voter not in suffrages, {}", address)));
            }
            let index = fact_hashes
                .iter()
                .position(|h| *h == vote.fact)
                .ok_or_else(|| AgoraError::invalid(format!("vote for unknown fact, {}", vote.fact)))?;
            counts[index] += 1;

            vote.verify(network_id)?;
        }

        self.check_majority(&fact_hashes, &counts)
    }

    fn check_majority(&self, fact_hashes: &[Hash], counts: &[u64]) -> Result<()> {
        match find_majority(self.threshold.total, self.threshold.threshold, counts) {
            MajorityResult::Majority(i) => {
                let expected = fact_hashes[i];
                match &self.majority {
                    Some(m) if self.result == VoteResult::Majority && m.hash() == expected => Ok(()),
                    _ => Err(AgoraError::invalid(format!(
                        "majority does not match votes; expected={}",
                        expected
                    ))),
                }
            }
            other if other.result() == self.result => Ok(()),
            other => Err(AgoraError::invalid(format!(
                "result does not match votes; expected={} result={}",
                other.result(),
                self.result
            ))),
        }
    }
}

impl PartialEq for Voteproof {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl fmt::Display for Voteproof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voteproof({} {})", self.stage_point(), self.result)
    }
}

/// Order voteproofs by `(height, round, stage)`; a missing voteproof is the
/// lowest
pub fn compare_voteproof(a: Option<&Voteproof>, b: Option<&Voteproof>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.stage_point().cmp(&b.stage_point()),
    }
}
