//! # States Context
//!
//! Everything the states share: collaborators, the last voteproofs, the
//! broadcast timers and the queues feeding the state machine.
//!
//! ```text
//!   peer seal ─► new_seal ─┬─ proposal ─► ProposalChecker ─► proposal queue
//!                          └─ ballot   ─► BallotChecker ─► Ballotbox
//!                                                            │ voteproof
//!                                                            ▼
//!                                                      voteproof queue
//! ```

use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, trace};

use agora_core::{NodeState, SharedClock, Stage};

use crate::ballot::{Ballot, Proposal, Seal};
use crate::ballotbox::Ballotbox;
use crate::checker::{BallotChecker, ProposalChecker};
use crate::database::Database;
use crate::error::{ConsensusError, ConsensusResult};
use crate::handover::Handover;
use crate::local::LocalNode;
use crate::network::{Channel, Discovery, Nodepool};
use crate::policy::LocalPolicy;
use crate::processor::{Block, ProcessorPool};
use crate::suffrage::Suffrage;
use crate::syncer::SyncersFactory;
use crate::timer::{ContextTimer, TimerId, Timers};
use crate::voteproof::{compare_voteproof, Voteproof};

use super::ballot::ProposalMaker;
use super::{StateEvent, StateSwitchContext};

/// A broadcast ballot is signed again every this many firings
pub(super) const RESIGN_EVERY: usize = 5;

pub struct StatesContext {
    pub(super) local: LocalNode,
    pub(super) policy: LocalPolicy,
    pub(super) suffrage: Arc<dyn Suffrage>,
    pub(super) database: Arc<dyn Database>,
    pub(super) nodepool: Arc<Nodepool>,
    pub(super) ballotbox: Arc<Ballotbox>,
    pub(super) processors: Arc<dyn ProcessorPool>,
    pub(super) syncers: Arc<dyn SyncersFactory>,
    pub(super) discovery: Option<Arc<dyn Discovery>>,
    pub(super) handover: Option<Arc<Handover>>,
    pub(super) clock: SharedClock,
    pub(super) proposal_maker: Arc<ProposalMaker>,
    pub(super) timers: Arc<Timers>,
    pub(super) state: RwLock<NodeState>,
    last_voteproof: RwLock<Option<Voteproof>>,
    last_init_voteproof: RwLock<Option<Voteproof>>,
    switch_tx: mpsc::Sender<StateSwitchContext>,
    voteproof_tx: mpsc::Sender<Voteproof>,
    proposal_tx: mpsc::Sender<Proposal>,
    events: broadcast::Sender<StateEvent>,
    /// Last voteproof injected from a carried one, so the same one is not
    /// fed twice
    pub(super) last_injected: Mutex<Option<Voteproof>>,
}

/// Receiving halves handed to the machine
pub(crate) struct ContextQueues {
    pub switch: mpsc::Receiver<StateSwitchContext>,
    pub voteproof: mpsc::Receiver<Voteproof>,
    pub proposal: mpsc::Receiver<Proposal>,
}

/// Collaborators a context is built from
pub(super) struct ContextParts {
    pub local: LocalNode,
    pub policy: LocalPolicy,
    pub suffrage: Arc<dyn Suffrage>,
    pub database: Arc<dyn Database>,
    pub nodepool: Arc<Nodepool>,
    pub ballotbox: Arc<Ballotbox>,
    pub processors: Arc<dyn ProcessorPool>,
    pub syncers: Arc<dyn SyncersFactory>,
    pub discovery: Option<Arc<dyn Discovery>>,
    pub handover: Option<Arc<Handover>>,
    pub clock: SharedClock,
    pub proposal_maker: Arc<ProposalMaker>,
}

impl StatesContext {
    pub(super) fn new(parts: ContextParts, capacity: usize, events_capacity: usize) -> (Arc<Self>, ContextQueues) {
        let (switch_tx, switch) = mpsc::channel(capacity);
        let (voteproof_tx, voteproof) = mpsc::channel(capacity);
        let (proposal_tx, proposal) = mpsc::channel(capacity);
        let (events, _) = broadcast::channel(events_capacity);

        let ctx = Arc::new(Self {
            local: parts.local,
            policy: parts.policy,
            suffrage: parts.suffrage,
            database: parts.database,
            nodepool: parts.nodepool,
            ballotbox: parts.ballotbox,
            processors: parts.processors,
            syncers: parts.syncers,
            discovery: parts.discovery,
            handover: parts.handover,
            clock: parts.clock,
            proposal_maker: parts.proposal_maker,
            timers: Arc::new(Timers::new(&super::ALL_TIMERS, false)),
            state: RwLock::new(NodeState::Stopped),
            last_voteproof: RwLock::new(None),
            last_init_voteproof: RwLock::new(None),
            switch_tx,
            voteproof_tx,
            proposal_tx,
            events,
            last_injected: Mutex::new(None),
        });

        (
            ctx,
            ContextQueues {
                switch,
                voteproof,
                proposal,
            },
        )
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn policy(&self) -> &LocalPolicy {
        &self.policy
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub(super) fn set_state(&self, state: NodeState) {
        *self.state.write() = state;
    }

    pub fn last_voteproof(&self) -> Option<Voteproof> {
        self.last_voteproof.read().clone()
    }

    pub fn last_init_voteproof(&self) -> Option<Voteproof> {
        self.last_init_voteproof.read().clone()
    }

    /// Record `voteproof` when it is newer than the last one
    pub fn set_last_voteproof(&self, voteproof: &Voteproof) -> bool {
        let mut last = self.last_voteproof.write();
        if compare_voteproof(Some(voteproof), last.as_ref()) != Ordering::Greater {
            return false;
        }
        *last = Some(voteproof.clone());
        if voteproof.stage == Stage::Init {
            *self.last_init_voteproof.write() = Some(voteproof.clone());
        }
        true
    }

    /// Overwrite both last voteproofs, as loaded from storage
    pub(super) fn reset_last_voteproofs(&self, last: Option<Voteproof>, last_init: Option<Voteproof>) {
        *self.last_voteproof.write() = last;
        *self.last_init_voteproof.write() = last_init;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub(super) fn emit(&self, event: StateEvent) {
        // no subscriber is fine
        let _ = self.events.send(event);
    }

    pub(super) fn new_blocks(&self, blocks: Vec<Block>) {
        if !blocks.is_empty() {
            self.emit(StateEvent::NewBlocks(blocks));
        }
    }

    pub fn is_local_in_suffrage(&self) -> bool {
        self.suffrage.is_inside(self.local.address())
    }

    pub fn under_handover(&self) -> bool {
        self.handover.as_ref().map(|hd| hd.under_handover()).unwrap_or(false)
    }

    pub fn handover_ready(&self) -> bool {
        self.handover.as_ref().map(|hd| hd.is_ready()).unwrap_or(false)
    }

    pub fn old_node(&self) -> Option<Arc<dyn Channel>> {
        self.handover.as_ref().and_then(|hd| hd.old_node())
    }

    /// Live remote channels, plus the old node under handover
    pub(super) fn syncable_channels(&self) -> Vec<Arc<dyn Channel>> {
        let mut channels: Vec<Arc<dyn Channel>> = self.nodepool.remote_channels().into_iter().map(|(_, ch)| ch).collect();
        if let Some(old) = self.old_node() {
            if !channels.iter().any(|ch| ch.conn_info() == old.conn_info()) {
                channels.push(old);
            }
        }
        channels
    }

    /// Queue a voteproof for the machine
    pub fn new_voteproof(&self, voteproof: Voteproof) {
        enqueue(&self.voteproof_tx, voteproof, "voteproof");
    }

    /// Queue a validated proposal for the machine
    pub fn new_proposal(&self, proposal: Proposal) {
        enqueue(&self.proposal_tx, proposal, "proposal");
    }

    /// Ask the machine to switch state outside of a state handler
    pub fn switch_state(&self, sctx: StateSwitchContext) -> ConsensusResult<()> {
        sctx.is_valid()?;
        enqueue(&self.switch_tx, sctx, "switch context");
        Ok(())
    }

    /// Send `seal` to the suffrage and the passthroughs; with `to_local` the
    /// seal also goes through the local ingress
    pub fn broadcast(self: &Arc<Self>, seal: Seal, to_local: bool) {
        let ctx = self.clone();
        tokio::spawn(async move {
            if to_local {
                if let Err(e) = ctx.new_seal(&seal).await {
                    if e.is_ignore() {
                        trace!(error = %e, "local seal ignored");
                    } else {
                        error!(seal = %seal.hash(), error = %e, "failed to send seal to local");
                    }
                }
            }

            let suffrage = ctx.suffrage.clone();
            let sent = ctx
                .nodepool
                .broadcast(&seal, None, ctx.policy.network_connection_timeout(), |a| suffrage.is_inside(a))
                .await;
            trace!(seal = %seal.hash(), sent, "seal broadcast");
        });
    }

    /// Timer broadcasting `ballot` on every firing. With `to_local` the
    /// first firing also votes locally; with `resign` the ballot is signed
    /// again now and then so it stays within the valid timespan of the
    /// receivers.
    pub(super) fn ballot_timer<I>(
        self: &Arc<Self>,
        id: TimerId,
        ballot: Ballot,
        resign: bool,
        to_local: bool,
        interval: I,
    ) -> ContextTimer
    where
        I: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let ballot = Arc::new(Mutex::new(ballot));

        ContextTimer::new(id, Duration::from_secs(1), move |i| {
            let weak = weak.clone();
            let ballot = ballot.clone();
            async move {
                let ctx = match weak.upgrade() {
                    Some(ctx) => ctx,
                    None => return Ok(false),
                };

                let seal = {
                    let mut b = ballot.lock();
                    if resign && i > 0 && i % RESIGN_EVERY == 0 {
                        b.resign(&ctx.local, &ctx.policy.network_id, ctx.clock.now());
                    }
                    Seal::Ballot(b.clone())
                };
                ctx.broadcast(seal, to_local && i == 0);
                Ok(true)
            }
        })
        .with_interval(interval)
    }

    /// Entry point of a ballot or proposal from anywhere
    pub async fn new_seal(self: &Arc<Self>, seal: &Seal) -> ConsensusResult<()> {
        let ballot = match seal {
            Seal::Ballot(b) => b,
            Seal::Handover(_) => return Err(ConsensusError::invalid("handover seal is not for states")),
        };

        if !self.is_local_in_suffrage() {
            trace!(ballot = %ballot.stage_point(), "local is not in suffrage; ballot ignored");
            return Ok(());
        }

        if ballot.stage() == Stage::Proposal {
            return self.new_proposal_seal(ballot).await;
        }

        let last = self.last_voteproof();
        let checker = self
            .ballot_checker(ballot, last.as_ref())
            .with_timespan(self.clock.now(), self.policy.timespan_valid_ballot());
        checker.check()?;
        if let Some(fetched) = checker
            .check_proposal_in_accept(self.database.as_ref(), &self.policy.network_id)
            .await?
        {
            debug!(proposal = %fetched.point(), "proposal of accept ballot fetched");
            self.new_proposal(fetched);
        }

        match self.ballotbox.vote(ballot)? {
            Some(vp) => {
                debug!(voteproof = %vp.stage_point(), result = %vp.result, "new voteproof from ballotbox");
                self.new_voteproof(vp);
            }
            None => {
                if ballot.node() != self.local.address() {
                    self.check_ballot_voteproof(ballot);
                }
            }
        }
        Ok(())
    }

    fn ballot_checker<'a>(&'a self, ballot: &'a Ballot, last: Option<&'a Voteproof>) -> BallotChecker<'a> {
        BallotChecker::new(
            ballot,
            self.suffrage.as_ref(),
            &self.nodepool,
            self.policy.threshold_ratio(),
            last,
        )
    }

    async fn new_proposal_seal(self: &Arc<Self>, proposal: &Proposal) -> ConsensusResult<()> {
        let is_local = proposal.node() == self.local.address();
        if is_local && !self.under_handover() {
            // the local proposer processes its own proposal directly
            return Ok(());
        }

        self.ballot_checker(proposal, None).check_voteproof()?;

        let livp = self.last_init_voteproof();
        let checker = ProposalChecker::new(
            self.database.as_ref(),
            &self.nodepool,
            self.suffrage.as_ref(),
            &self.policy.network_id,
            proposal,
            livp.as_ref(),
        );

        if is_local {
            checker.save_proposal().await?;
        } else {
            match checker.check_ingress().await {
                Ok(()) => {}
                Err(e) if e.is_known_seal() || e.is_ignore() => {
                    trace!(proposal = %proposal.point(), error = %e, "proposal skipped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        checker.is_older()?;

        self.check_ballot_voteproof(proposal);
        self.new_proposal(proposal.clone());
        Ok(())
    }

    /// A ballot from a node ahead of us carries the voteproof we missed.
    /// The carried voteproof has passed [`BallotChecker::check_voteproof`].
    fn check_ballot_voteproof(&self, ballot: &Ballot) {
        if !matches!(
            self.state(),
            NodeState::Joining | NodeState::Consensus | NodeState::Syncing | NodeState::Handover
        ) {
            return;
        }

        let last = self.last_voteproof();
        let carried = match self.ballot_checker(ballot, last.as_ref()).carried_newer_voteproof() {
            Some(vp) => vp,
            None => return,
        };

        {
            let mut injected = self.last_injected.lock();
            if compare_voteproof(Some(&carried), injected.as_ref()) != Ordering::Greater {
                return;
            }
            *injected = Some(carried.clone());
        }

        debug!(
            ballot = %ballot.stage_point(),
            voteproof = %carried.stage_point(),
            "newer voteproof found in ballot"
        );
        self.new_voteproof(carried);
    }

    /// Join the discovery network; under handover the old node keeps
    /// receiving our seals instead
    pub(super) async fn join_discovery(&self) -> ConsensusResult<()> {
        let discovery = match &self.discovery {
            Some(d) => d,
            None => return Ok(()),
        };

        if self.under_handover() {
            if let Some(old) = self.old_node() {
                if !self.nodepool.exists_passthrough(old.conn_info()) {
                    self.nodepool.set_passthrough(old, None)?;
                }
            }
        }

        if self.suffrage.nodes().len() < 2 {
            debug!("suffrage has less than two nodes; discovery skipped");
            return Ok(());
        }

        match discovery.join().await {
            Ok(()) => {
                debug!("joined discovery");
                Ok(())
            }
            Err(e) if e.is_ignore() => {
                debug!(error = %e, "joining discovery skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(super) fn is_joined(&self) -> bool {
        self.discovery.as_ref().map(|d| d.is_joined()).unwrap_or(true)
    }

    pub(super) async fn leave_discovery(&self) -> ConsensusResult<()> {
        match &self.discovery {
            Some(d) if d.is_joined() => d.leave().await,
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for StatesContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatesContext")
            .field("local", self.local.address())
            .field("state", &self.state())
            .field("last_voteproof", &self.last_voteproof().map(|vp| vp.stage_point()))
            .finish()
    }
}

/// Push into a queue without blocking the caller; a full queue is drained
/// by a spawned sender
fn enqueue<T: Send + 'static>(tx: &mpsc::Sender<T>, item: T, what: &'static str) {
    match tx.try_send(item) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(item)) => {
            let tx = tx.clone();
            tokio::spawn(async move {
                if tx.send(item).await.is_err() {
                    trace!(what, "queue closed");
                }
            });
        }
        Err(mpsc::error::TrySendError::Closed(_)) => trace!(what, "queue closed"),
    }
}
