//! # Checkers
//!
//! Validation pipelines run before anything reaches a state:
//!
//! ```text
//!   ballot    ─► BallotChecker    ─► Ballotbox
//!   proposal  ─► ProposalChecker  ─► proposal channel
//!   voteproof ─► VoteproofChecker ─► current state
//! ```
//!
//! Checkers fail with control kinds: `Ignore` drops the input quietly,
//! `KnownSeal` marks something already stored, and `SyncByVoteproof` asks
//! the state machine to start syncing.
//!
//! A signature only proves something when the key belongs to the node, so
//! every seal and every vote inside a voteproof is matched against the key
//! the [`Nodepool`] knows for its node.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use agora_core::{Address, AgoraError, Height, NetworkId, NodeState, Stage, ThresholdRatio, VoteResult};
use agora_crypto::{Hash, PublicKey};

use crate::ballot::{Ballot, Proposal};
use crate::database::{block_hash_at, store_proposal, Database};
use crate::error::{ConsensusError, ConsensusResult};
use crate::network::Nodepool;
use crate::suffrage::Suffrage;
use crate::voteproof::{compare_voteproof, Voteproof};

/// `signer` must be the key the nodepool knows for `node`
pub fn check_signing_node(nodepool: &Nodepool, node: &Address, signer: &PublicKey) -> ConsensusResult<()> {
    match nodepool.public_key(node) {
        None => Err(ConsensusError::invalid(format!("node not found, {}", node))),
        Some(known) if known != *signer => Err(AgoraError::SignatureVerificationFailed(format!(
            "public key of {} not matched; known={} signer={}",
            node, known, signer
        ))
        .into()),
        Some(_) => Ok(()),
    }
}

/// A voteproof counts only when it was built over the local acting
/// suffrage with the local threshold ratio, and every vote is signed by its
/// voter's known key. The companion ACCEPT voteproof is checked the same
/// way.
///
/// Genesis voteproofs are made by the genesis generator alone and are not
/// checked.
pub fn check_voteproof_suffrage(
    voteproof: &Voteproof,
    suffrage: &dyn Suffrage,
    nodepool: &Nodepool,
    ratio: ThresholdRatio,
) -> ConsensusResult<()> {
    if voteproof.height <= Height::GENESIS {
        return Ok(());
    }

    let acting = suffrage.acting(voteproof.height, voteproof.round);
    if voteproof.threshold.total != acting.nodes.len() as u64 {
        return Err(ConsensusError::invalid(format!(
            "threshold total of {} does not match acting suffrage; total={} acting={}",
            voteproof,
            voteproof.threshold.total,
            acting.nodes.len()
        )));
    }
    if voteproof.threshold.ratio != ratio {
        return Err(ConsensusError::invalid(format!(
            "threshold ratio of {} does not match policy; ratio={} policy={}",
            voteproof, voteproof.threshold.ratio, ratio
        )));
    }

    let suffrages: HashSet<&Address> = voteproof.suffrages.iter().collect();
    if suffrages.len() != acting.nodes.len() || !acting.nodes.iter().all(|a| suffrages.contains(a)) {
        return Err(ConsensusError::invalid(format!(
            "suffrages of {} differ from acting suffrage",
            voteproof
        )));
    }

    for (address, vote) in &voteproof.votes {
        if !acting.exists(address) {
            return Err(ConsensusError::invalid(format!(
                "voter of {} not in acting suffrage, {}",
                voteproof, address
            )));
        }
        check_signing_node(nodepool, address, &vote.signer)?;
    }

    match voteproof.accept() {
        Some(accept) => check_voteproof_suffrage(accept, suffrage, nodepool, ratio),
        None => Ok(()),
    }
}

/// Checks a finished voteproof against the local view before dispatch
pub struct VoteproofChecker<'a> {
    database: &'a dyn Database,
    nodepool: &'a Nodepool,
    suffrage: &'a dyn Suffrage,
    network_id: &'a NetworkId,
    ratio: ThresholdRatio,
    last: Option<&'a Voteproof>,
    voteproof: &'a Voteproof,
}

impl<'a> VoteproofChecker<'a> {
    pub fn new(
        database: &'a dyn Database,
        nodepool: &'a Nodepool,
        suffrage: &'a dyn Suffrage,
        network_id: &'a NetworkId,
        ratio: ThresholdRatio,
        last: Option<&'a Voteproof>,
        voteproof: &'a Voteproof,
    ) -> Self {
        Self {
            database,
            nodepool,
            suffrage,
            network_id,
            ratio,
            last,
            voteproof,
        }
    }

    pub async fn check(&self) -> ConsensusResult<()> {
        self.check_suffrage()?;
        self.check_point()?;
        self.check_init_with_local_block().await?;
        self.check_accept_proposal().await
    }

    pub fn check_suffrage(&self) -> ConsensusResult<()> {
        check_voteproof_suffrage(self.voteproof, self.suffrage, self.nodepool, self.ratio)
    }

    /// Where the voteproof sits relative to the last one
    pub fn check_point(&self) -> ConsensusResult<()> {
        let vp = self.voteproof;
        let last = match self.last {
            Some(last) => last,
            None => return Ok(()),
        };

        match vp.stage {
            Stage::Init => {
                if vp.height == last.height && vp.round > last.round {
                    return Ok(());
                }
                let d = vp.height - last.height.next();
                if d > 0 {
                    return Err(AgoraError::SyncByVoteproof(format!(
                        "init voteproof height {} is ahead of last voteproof {}",
                        vp.height, last.height
                    ))
                    .into());
                }
                if d < 0 {
                    return Err(ConsensusError::ignore(format!(
                        "init voteproof height {} is behind last voteproof {}",
                        vp.height, last.height
                    )));
                }
                Ok(())
            }
            Stage::Accept => {
                let d = vp.height - last.height;
                if d > 0 {
                    return Err(AgoraError::SyncByVoteproof(format!(
                        "accept voteproof height {} is ahead of last voteproof {}",
                        vp.height, last.height
                    ))
                    .into());
                }
                if d < 0 {
                    return Err(ConsensusError::ignore("accept voteproof is behind last voteproof"));
                }
                match last.stage {
                    Stage::Init if vp.round < last.round => Err(ConsensusError::ignore(
                        "accept voteproof has lower round than last init voteproof",
                    )),
                    Stage::Accept if vp.round <= last.round => Err(ConsensusError::ignore(
                        "accept voteproof has same or lower round than last accept voteproof",
                    )),
                    _ => Ok(()),
                }
            }
            stage => Err(ConsensusError::invalid(format!("not supported voteproof stage, {}", stage))),
        }
    }

    /// The previous block of a majority INIT fact must be our block
    pub async fn check_init_with_local_block(&self) -> ConsensusResult<()> {
        if self.voteproof.stage != Stage::Init {
            return Ok(());
        }
        let fact = match self.voteproof.majority_init() {
            Some(fact) => fact,
            None => return Ok(()),
        };

        match block_hash_at(self.database, self.voteproof.height.prev()).await {
            Ok(local) if local == fact.previous_block => Ok(()),
            Ok(local) => Err(AgoraError::SyncByVoteproof(format!(
                "previous block of init voteproof differs from local; previous={} local={}",
                fact.previous_block, local
            ))
            .into()),
            Err(e) if e.is_not_found() || e.is_ignore() => Ok(()),
            Err(e) => Err(AgoraError::SyncByVoteproof(e.to_string()).into()),
        }
    }

    /// Make sure the proposal an ACCEPT majority voted for is stored
    /// locally, fetching it from the voters otherwise
    pub async fn check_accept_proposal(&self) -> ConsensusResult<()> {
        if self.voteproof.stage != Stage::Accept || self.voteproof.result != VoteResult::Majority {
            return Ok(());
        }
        let fact = match self.voteproof.majority_accept() {
            Some(fact) => fact,
            None => return Ok(()),
        };
        if self.database.proposal(&fact.proposal).await?.is_some() {
            return Ok(());
        }

        let majority = match &self.voteproof.majority {
            Some(m) => m.hash(),
            None => return Ok(()),
        };

        let mut found: Option<Proposal> = None;
        for voter in self.voteproof.voters_of(&majority) {
            if voter == *self.nodepool.local().address() {
                continue;
            }
            let ch = match self.nodepool.channel(&voter) {
                Some(ch) => ch,
                None => {
                    debug!(node = %voter, "voter of accept voteproof is unknown or dead");
                    continue;
                }
            };
            match ch.proposal_by_hash(&fact.proposal).await {
                Ok(Some(p)) => {
                    found = Some(p);
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    return Err(ConsensusError::invalid(format!(
                        "failed to request proposal of accept voteproof from {}: {}",
                        voter, e
                    )))
                }
            }
        }

        let proposal = found.ok_or_else(|| ConsensusError::not_found("proposal of accept voteproof"))?;

        let checker = ProposalChecker::new(
            self.database,
            self.nodepool,
            self.suffrage,
            self.network_id,
            &proposal,
            None,
        );
        match checker.check_ingress().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_ignore() || e.is_known_seal() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Validates a proposal before the current state sees it
pub struct ProposalChecker<'a> {
    database: &'a dyn Database,
    nodepool: &'a Nodepool,
    suffrage: &'a dyn Suffrage,
    network_id: &'a NetworkId,
    proposal: &'a Proposal,
    last_init: Option<&'a Voteproof>,
}

impl<'a> ProposalChecker<'a> {
    pub fn new(
        database: &'a dyn Database,
        nodepool: &'a Nodepool,
        suffrage: &'a dyn Suffrage,
        network_id: &'a NetworkId,
        proposal: &'a Proposal,
        last_init: Option<&'a Voteproof>,
    ) -> Self {
        Self {
            database,
            nodepool,
            suffrage,
            network_id,
            proposal,
            last_init,
        }
    }

    /// A proposal from a peer: unknown, correctly signed, then stored
    pub async fn check_ingress(&self) -> ConsensusResult<()> {
        self.is_known().await?;
        self.check_signing()?;
        self.save_proposal().await
    }

    /// Dispatch checks against the last INIT voteproof
    pub fn check_dispatch(&self) -> ConsensusResult<()> {
        self.is_older()?;
        self.is_waiting()?;
        self.is_proposer()
    }

    pub async fn is_known(&self) -> ConsensusResult<()> {
        let fact = self.proposal.fact().hash();
        if self.database.proposal(&fact).await?.is_some() || self.database.has_seal(&self.proposal.hash()).await? {
            return Err(AgoraError::KnownSeal(format!("proposal {}", fact)).into());
        }
        Ok(())
    }

    pub fn check_signing(&self) -> ConsensusResult<()> {
        let fact = self
            .proposal
            .proposal_fact()
            .ok_or_else(|| ConsensusError::invalid("not proposal ballot"))?;
        if fact.proposer != *self.proposal.node() {
            return Err(ConsensusError::invalid(format!(
                "proposal signed by {}, not by proposer {}",
                self.proposal.node(),
                fact.proposer
            )));
        }
        check_signing_node(self.nodepool, self.proposal.node(), &self.proposal.fact_sign().signer)?;
        self.proposal.is_valid(self.network_id)?;
        Ok(())
    }

    pub async fn save_proposal(&self) -> ConsensusResult<()> {
        store_proposal(self.database, self.proposal).await?;
        Ok(())
    }

    pub fn is_older(&self) -> ConsensusResult<()> {
        match self.last_init {
            Some(livp) if self.proposal.point() < livp.point() => Err(ConsensusError::ignore(format!(
                "proposal {} is older than last init voteproof {}",
                self.proposal.point(),
                livp.point()
            ))),
            _ => Ok(()),
        }
    }

    pub fn is_waiting(&self) -> ConsensusResult<()> {
        match self.last_init {
            Some(livp) if self.proposal.point() != livp.point() => Err(ConsensusError::ignore(format!(
                "proposal {} is not the one waited for, {}",
                self.proposal.point(),
                livp.point()
            ))),
            None => Err(ConsensusError::ignore("no init voteproof to wait proposal for")),
            _ => Ok(()),
        }
    }

    pub fn is_proposer(&self) -> ConsensusResult<()> {
        let p = self.proposal;
        if !self.suffrage.is_proposer(p.height(), p.round(), p.node()) {
            return Err(ConsensusError::invalid(format!(
                "{} is not the proposer of {}",
                p.node(),
                p.point()
            )));
        }
        Ok(())
    }
}

/// Validates an incoming ballot before it is voted
pub struct BallotChecker<'a> {
    ballot: &'a Ballot,
    suffrage: &'a dyn Suffrage,
    nodepool: &'a Nodepool,
    ratio: ThresholdRatio,
    last: Option<&'a Voteproof>,
    now: DateTime<Utc>,
    timespan: Duration,
}

impl<'a> BallotChecker<'a> {
    pub fn new(
        ballot: &'a Ballot,
        suffrage: &'a dyn Suffrage,
        nodepool: &'a Nodepool,
        ratio: ThresholdRatio,
        last: Option<&'a Voteproof>,
    ) -> Self {
        Self {
            ballot,
            suffrage,
            nodepool,
            ratio,
            last,
            now: Utc::now(),
            timespan: Duration::from_secs(60),
        }
    }

    /// Judge `signed_at` against `now`, allowing `timespan` either way
    pub fn with_timespan(mut self, now: DateTime<Utc>, timespan: Duration) -> Self {
        self.now = now;
        self.timespan = timespan;
        self
    }

    pub fn check(&self) -> ConsensusResult<()> {
        self.in_timespan()?;
        self.in_suffrage()?;
        self.check_signing()?;
        self.is_from_alive_node()?;
        self.is_not_behind()?;
        self.check_voteproof()
    }

    /// `signed_at` within the valid window around now
    pub fn in_timespan(&self) -> ConsensusResult<()> {
        let span = chrono::Duration::from_std(self.timespan).unwrap_or_else(|_| chrono::Duration::zero());
        let signed_at = self.ballot.signed_at();
        if signed_at < self.now - span || signed_at > self.now + span {
            return Err(ConsensusError::invalid(format!(
                "ballot signed at {} is out of the valid timespan",
                signed_at
            )));
        }
        Ok(())
    }

    pub fn in_suffrage(&self) -> ConsensusResult<()> {
        if !self.suffrage.is_inside(self.ballot.node()) {
            return Err(ConsensusError::ignore(format!(
                "ballot from {} outside of suffrage",
                self.ballot.node()
            )));
        }
        Ok(())
    }

    /// The ballot is signed with the key known for its node
    pub fn check_signing(&self) -> ConsensusResult<()> {
        check_signing_node(self.nodepool, self.ballot.node(), &self.ballot.fact_sign().signer)
    }

    pub fn is_from_alive_node(&self) -> ConsensusResult<()> {
        let node = self.ballot.node();
        if !self.nodepool.exists(node) {
            return Err(ConsensusError::invalid(format!("ballot from unknown node, {}", node)));
        }
        if !self.nodepool.is_alive(node) {
            return Err(ConsensusError::invalid(format!("ballot from dead node, {}", node)));
        }
        Ok(())
    }

    /// Lower height, or same height and lower round, than the last
    /// voteproof is stale
    pub fn is_not_behind(&self) -> ConsensusResult<()> {
        let last = match self.last {
            Some(last) => last,
            None => return Ok(()),
        };
        let b = self.ballot;
        if b.height() < last.height || (b.height() == last.height && b.round() < last.round) {
            return Err(ConsensusError::ignore(format!(
                "ballot {} is behind last voteproof {}",
                b.stage_point(),
                last.stage_point()
            )));
        }
        Ok(())
    }

    /// Voteproofs the ballot carries come from the local suffrage
    pub fn check_voteproof(&self) -> ConsensusResult<()> {
        match self.ballot.carried_voteproof() {
            Some(vp) => check_voteproof_suffrage(&vp, self.suffrage, self.nodepool, self.ratio),
            None => Ok(()),
        }
    }

    /// The proposal an ACCEPT ballot votes for must be known and at the
    /// ballot's point. An unknown proposal is requested from the ballot's
    /// node first, then from the other live members, and stored once it
    /// passes the proposal checks. Returns the proposal when it was fetched.
    pub async fn check_proposal_in_accept(
        &self,
        database: &dyn Database,
        network_id: &NetworkId,
    ) -> ConsensusResult<Option<Proposal>> {
        let fact = match self.ballot.fact().as_accept() {
            Some(fact) => fact,
            None => return Ok(None),
        };

        let (proposal, fetched) = match database.proposal(&fact.proposal).await? {
            Some(p) => (p, false),
            None => (self.request_proposal(database, network_id, &fact.proposal).await?, true),
        };

        if proposal.height() != self.ballot.height() || proposal.round() != self.ballot.round() {
            return Err(ConsensusError::invalid(format!(
                "proposal of accept ballot is at {}, not at ballot {}",
                proposal.point(),
                self.ballot.point()
            )));
        }

        Ok(fetched.then_some(proposal))
    }

    async fn request_proposal(
        &self,
        database: &dyn Database,
        network_id: &NetworkId,
        fact_hash: &Hash,
    ) -> ConsensusResult<Proposal> {
        let mut remotes = self.nodepool.remote_channels();
        remotes.retain(|(address, _)| self.suffrage.is_inside(address));
        remotes.sort_by_key(|(address, _)| address != self.ballot.node());

        for (address, ch) in remotes {
            let proposal = match ch.proposal_by_hash(fact_hash).await {
                Ok(Some(p)) if p.fact().hash() == *fact_hash => p,
                Ok(_) => continue,
                Err(e) => {
                    debug!(node = %address, error = %e, "failed to request proposal of accept ballot");
                    continue;
                }
            };

            let checker = ProposalChecker::new(database, self.nodepool, self.suffrage, network_id, &proposal, None);
            match checker.check_ingress().await {
                Ok(()) => return Ok(proposal),
                Err(e) if e.is_ignore() || e.is_known_seal() => return Ok(proposal),
                Err(e) => debug!(node = %address, error = %e, "invalid proposal of accept ballot received"),
            }
        }

        Err(ConsensusError::not_found(format!("proposal {} of accept ballot", fact_hash)))
    }

    /// Voteproof carried by the ballot when it is ahead of the last one
    pub fn carried_newer_voteproof(&self) -> Option<Voteproof> {
        let carried = self.ballot.carried_voteproof()?;
        match compare_voteproof(Some(&carried), self.last) {
            std::cmp::Ordering::Greater => Some(carried),
            _ => None,
        }
    }
}

/// Transition observed by [`StuckDetector::check`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StuckTransition {
    Unchanged,
    Stuck,
    Released,
}

/// Reports when the last voteproof grows too old while in consensus
#[derive(Debug)]
pub struct StuckDetector {
    endure: chrono::Duration,
    stuck: Arc<AtomicBool>,
}

impl StuckDetector {
    pub fn new(endure: Duration) -> Self {
        Self {
            endure: chrono::Duration::from_std(endure).unwrap_or_else(|_| chrono::Duration::seconds(60)),
            stuck: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck.load(Ordering::SeqCst)
    }

    pub fn check(&self, state: NodeState, last: Option<&Voteproof>, now: DateTime<Utc>) -> StuckTransition {
        let too_old = match last {
            Some(vp) => state == NodeState::Consensus && now - vp.finished_at > self.endure,
            None => false,
        };

        let was = self.stuck.swap(too_old, Ordering::SeqCst);
        match (was, too_old) {
            (false, true) => {
                warn!(
                    last_voteproof = ?last.map(Voteproof::stage_point),
                    endure = %self.endure,
                    "consensus stuck"
                );
                StuckTransition::Stuck
            }
            (true, false) => {
                warn!("consensus released from stuck");
                StuckTransition::Released
            }
            _ => StuckTransition::Unchanged,
        }
    }
}
