//! # Ballotbox
//!
//! Aggregates votes per `(height, round, stage)` and emits a voteproof the
//! moment a record finishes.
//!
//! ```text
//!   Ballot ──► VoteRecord(point) ──► find_majority ──► NotYet
//!                                          │
//!                                          └──► Majority / Draw ──► Voteproof (record closed)
//! ```
//!
//! Each record sits behind its own lock, so concurrent votes for the same
//! point are serialized and only the vote that crosses the threshold sees a
//! voteproof. The collection lock is held only to look up or insert records
//! and while cleaning.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

use agora_core::{
    find_majority, Address, AgoraError, Height, MajorityResult, Result, SharedClock, StagePoint, Threshold,
    ThresholdRatio,
};
use agora_crypto::Hash;

use crate::ballot::{Ballot, BallotFact};
use crate::suffrage::Suffrage;
use crate::voteproof::{Voteproof, VoteproofNodeFact};

/// Votes collected at one point
#[derive(Debug)]
struct VoteRecord {
    point: StagePoint,
    suffrages: Vec<Address>,
    threshold: Threshold,
    facts: BTreeMap<Hash, BallotFact>,
    votes: BTreeMap<Address, VoteproofNodeFact>,
    voteproof: Option<Voteproof>,
}

impl VoteRecord {
    fn new(point: StagePoint, suffrages: Vec<Address>, threshold: Threshold) -> Self {
        Self {
            point,
            suffrages,
            threshold,
            facts: BTreeMap::new(),
            votes: BTreeMap::new(),
            voteproof: None,
        }
    }

    fn is_closed(&self) -> bool {
        self.voteproof.is_some()
    }

    /// Returns false when the voter already voted here
    fn add(&mut self, ballot: &Ballot) -> bool {
        let node = ballot.node();
        if self.votes.contains_key(node) {
            return false;
        }

        let fact = ballot.fact().clone();
        let fact_hash = fact.hash();
        let sign = ballot.fact_sign();

        self.votes.insert(
            node.clone(),
            VoteproofNodeFact {
                address: node.clone(),
                ballot: ballot.hash(),
                fact: fact_hash,
                fact_signature: sign.signature.clone(),
                signer: sign.signer,
                signed_at: sign.signed_at,
            },
        );
        self.facts.entry(fact_hash).or_insert(fact);
        true
    }

    /// Per-fact counts in fact hash order
    fn counts(&self) -> Vec<u64> {
        self.facts
            .keys()
            .map(|h| self.votes.values().filter(|v| v.fact == *h).count() as u64)
            .collect()
    }

    fn check(&mut self, clock: &SharedClock) -> Option<Voteproof> {
        let outcome = find_majority(self.threshold.total, self.threshold.threshold, &self.counts());
        let majority = match outcome {
            MajorityResult::NotYet => return None,
            MajorityResult::Draw => None,
            MajorityResult::Majority(i) => self.facts.values().nth(i).cloned(),
        };

        let vp = Voteproof::new(
            self.point,
            self.suffrages.clone(),
            self.threshold,
            outcome.result(),
            majority,
            self.facts.values().cloned().collect(),
            self.votes.clone(),
            clock.now(),
        );
        self.voteproof = Some(vp.clone());
        Some(vp)
    }
}

/// Vote aggregator
pub struct Ballotbox {
    suffrage: Arc<dyn Suffrage>,
    ratio: ThresholdRatio,
    clock: SharedClock,
    records: RwLock<BTreeMap<StagePoint, Arc<Mutex<VoteRecord>>>>,
    latest: RwLock<Option<Ballot>>,
}

impl Ballotbox {
    pub fn new(suffrage: Arc<dyn Suffrage>, ratio: ThresholdRatio, clock: SharedClock) -> Self {
        Self {
            suffrage,
            ratio,
            clock,
            records: RwLock::new(BTreeMap::new()),
            latest: RwLock::new(None),
        }
    }

    /// Record the vote of `ballot`; returns the voteproof when this vote
    /// finishes the point
    pub fn vote(&self, ballot: &Ballot) -> Result<Option<Voteproof>> {
        let point = ballot.stage_point();
        if !point.stage.can_vote() {
            return Err(AgoraError::invalid(format!("{} ballot can not vote", point.stage)));
        }

        let acting = self.suffrage.acting(point.height(), point.round());
        if !acting.exists(ballot.node()) {
            return Err(AgoraError::invalid(format!(
                "voter not in acting suffrage; voter={} point={}",
                ballot.node(),
                point
            )));
        }

        self.update_latest(ballot);

        let record = self.record(point, acting.nodes)?;
        let mut record = record.lock();

        if record.is_closed() {
            trace!(point = %point, voter = %ballot.node(), "vote record already closed");
            return Ok(None);
        }
        if !record.add(ballot) {
            trace!(point = %point, voter = %ballot.node(), "already voted");
            return Ok(None);
        }

        let vp = record.check(&self.clock);
        if let Some(vp) = &vp {
            debug!(
                height = %vp.height,
                round = %vp.round,
                stage = %vp.stage,
                result = %vp.result,
                votes = vp.votes.len(),
                "voteproof finished"
            );
        }
        Ok(vp)
    }

    fn record(&self, point: StagePoint, suffrages: Vec<Address>) -> Result<Arc<Mutex<VoteRecord>>> {
        if let Some(r) = self.records.read().get(&point) {
            return Ok(r.clone());
        }

        let threshold = Threshold::new(suffrages.len() as u64, self.ratio)?;
        let mut records = self.records.write();
        Ok(records
            .entry(point)
            .or_insert_with(|| Arc::new(Mutex::new(VoteRecord::new(point, suffrages, threshold))))
            .clone())
    }

    fn update_latest(&self, ballot: &Ballot) {
        let mut latest = self.latest.write();
        let newer = match latest.as_ref() {
            None => true,
            Some(b) => b.stage_point() < ballot.stage_point(),
        };
        if newer {
            *latest = Some(ballot.clone());
        }
    }

    /// The highest ballot seen so far
    pub fn latest_ballot(&self) -> Option<Ballot> {
        self.latest.read().clone()
    }

    /// The voteproof carried by the highest ballot seen so far
    pub fn latest_carried_voteproof(&self) -> Option<Voteproof> {
        self.latest.read().as_ref().and_then(Ballot::carried_voteproof)
    }

    /// Finished voteproof at `point`, if any
    pub fn voteproof(&self, point: StagePoint) -> Option<Voteproof> {
        let record = self.records.read().get(&point).cloned()?;
        let record = record.lock();
        record.voteproof.clone()
    }

    /// Number of votes recorded at `point`
    pub fn votes_at(&self, point: StagePoint) -> usize {
        self.records
            .read()
            .get(&point)
            .map(|r| r.lock().votes.len())
            .unwrap_or(0)
    }

    /// Drop every record at or below `height`
    pub fn clean(&self, height: Height) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|point, _| point.height() > height);
        let removed = before - records.len();
        if removed > 0 {
            debug!(height = %height, removed, "ballotbox cleaned");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl std::fmt::Debug for Ballotbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ballotbox")
            .field("suffrage", &self.suffrage.name())
            .field("ratio", &self.ratio)
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use agora_core::{Round, Stage, SystemClock, VoteResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ballotbox(n: usize) -> (Ballotbox, Vec<crate::local::LocalNode>) {
        let nodes = test_nodes(n);
        let suffrage = Arc::new(fixed_suffrage(&nodes));
        let bb = Ballotbox::new(
            suffrage,
            ThresholdRatio::new(TEST_RATIO).unwrap(),
            Arc::new(SystemClock),
        );
        (bb, nodes)
    }

    fn init_ballot(node: &crate::local::LocalNode, height: i64, previous: Hash) -> Ballot {
        sign_ballot(node, BallotFact::init(Height(height), Round(0), previous), None, None)
    }

    #[test]
    fn test_majority_at_threshold() {
        let (bb, nodes) = ballotbox(3);

        assert!(bb.vote(&init_ballot(&nodes[0], 0, genesis_hash())).unwrap().is_none());
        let vp = bb.vote(&init_ballot(&nodes[1], 0, genesis_hash())).unwrap().unwrap();

        assert_eq!(vp.result, VoteResult::Majority);
        assert_eq!(vp.stage, Stage::Init);
        assert_eq!(vp.votes.len(), 2);
        assert_eq!(vp.majority_init().unwrap().previous_block, genesis_hash());
        assert!(vp.is_valid(&network()).is_ok());
    }

    #[test]
    fn test_closed_record_emits_once() {
        let (bb, nodes) = ballotbox(3);

        bb.vote(&init_ballot(&nodes[0], 0, genesis_hash())).unwrap();
        assert!(bb.vote(&init_ballot(&nodes[1], 0, genesis_hash())).unwrap().is_some());
        assert!(bb.vote(&init_ballot(&nodes[2], 0, genesis_hash())).unwrap().is_none());

        let point = StagePoint::new(Height(0), Round(0), Stage::Init);
        assert_eq!(bb.voteproof(point).unwrap().votes.len(), 2);
    }

    #[test]
    fn test_first_vote_wins() {
        let (bb, nodes) = ballotbox(3);

        bb.vote(&init_ballot(&nodes[0], 0, genesis_hash())).unwrap();
        assert!(bb
            .vote(&init_ballot(&nodes[0], 0, Hash::digest(b"other")))
            .unwrap()
            .is_none());

        let point = StagePoint::new(Height(0), Round(0), Stage::Init);
        assert_eq!(bb.votes_at(point), 1);

        let vp = bb.vote(&init_ballot(&nodes[1], 0, genesis_hash())).unwrap().unwrap();
        assert_eq!(vp.result, VoteResult::Majority);
    }

    #[test]
    fn test_draw() {
        let (bb, nodes) = ballotbox(3);

        for (i, node) in nodes.iter().enumerate().take(2) {
            let vp = bb
                .vote(&init_ballot(node, 0, Hash::digest(format!("b{}", i).as_bytes())))
                .unwrap();
            assert!(vp.is_none());
        }
        let vp = bb.vote(&init_ballot(&nodes[2], 0, Hash::digest(b"b2"))).unwrap().unwrap();

        assert_eq!(vp.result, VoteResult::Draw);
        assert!(vp.majority.is_none());
        assert!(vp.is_valid(&network()).is_ok());
    }

    #[test]
    fn test_rejects_outsider_and_proposal() {
        let (bb, _) = ballotbox(3);
        let stranger = &test_nodes(5)[4];

        assert!(bb.vote(&init_ballot(stranger, 0, genesis_hash())).is_err());

        let proposal = sign_ballot(
            stranger,
            BallotFact::proposal(Height(0), Round(0), stranger.address().clone(), vec![], chrono::Utc::now()),
            None,
            None,
        );
        assert!(bb.vote(&proposal).is_err());
    }

    #[test]
    fn test_clean() {
        let (bb, nodes) = ballotbox(3);
        for h in 0..5 {
            bb.vote(&init_ballot(&nodes[0], h, genesis_hash())).unwrap();
        }
        assert_eq!(bb.len(), 5);

        assert_eq!(bb.clean(Height(2)), 3);
        assert_eq!(bb.len(), 2);
        assert!(bb.voteproof(StagePoint::new(Height(1), Round(0), Stage::Init)).is_none());
    }

    #[test]
    fn test_latest_ballot() {
        let (bb, nodes) = ballotbox(3);
        bb.vote(&init_ballot(&nodes[0], 3, genesis_hash())).unwrap();
        bb.vote(&init_ballot(&nodes[1], 1, genesis_hash())).unwrap();

        assert_eq!(bb.latest_ballot().unwrap().height(), Height(3));
    }

    #[test]
    fn test_single_voteproof_under_concurrency() {
        let nodes = test_nodes(7);
        let suffrage = Arc::new(fixed_suffrage(&nodes));
        let bb = Arc::new(Ballotbox::new(
            suffrage,
            ThresholdRatio::new(TEST_RATIO).unwrap(),
            Arc::new(SystemClock),
        ));
        let emitted = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|s| {
            for node in &nodes {
                let bb = bb.clone();
                let emitted = emitted.clone();
                s.spawn(move || {
                    if bb.vote(&init_ballot(node, 0, genesis_hash())).unwrap().is_some() {
                        emitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(emitted.load(Ordering::SeqCst), 1);
    }
}
