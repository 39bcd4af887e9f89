//! # Consensus State
//!
//! One round of agreement, driven by voteproofs:
//!
//! ```text
//!   INIT vp ─► find / make proposal ─► process ─► ACCEPT ballot (after wait)
//!      │              │
//!      │              └─ none ─► wait, then next round INIT ballot
//!      ▼
//!   ACCEPT vp ─► save block ─► INIT ballot of next height
//!      │
//!      └─ save failed ─► SYNCING
//!
//!   draw voteproof, either stage ─► next round INIT ballot
//! ```
//!
//! [`ConsensusBase`] holds the round logic; the handover state reuses it
//! behind a gate that keeps the new node quiet until it has caught up.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use agora_core::{Address, Height, NodeState, Round, Stage, VoteResult};
use agora_crypto::Hash;

use crate::ballot::{AcceptFact, Ballot, BallotFact, Proposal};
use crate::database::{proposal_with_retry, store_proposal};
use crate::error::{ConsensusError, ConsensusResult};
use crate::processor::failed_block_hash;
use crate::timer::{ContextTimer, MIN_INTERVAL};
use crate::voteproof::Voteproof;

use super::ballot::{next_init_from_accept, next_init_from_init};
use super::context::StatesContext;
use super::{
    State, StateSwitchContext, TIMER_BROADCAST_ACCEPT_BALLOT, TIMER_BROADCAST_INIT_BALLOT, TIMER_BROADCAST_PROPOSAL,
    TIMER_FIND_PROPOSAL,
};

/// Bound of the retried local proposal lookups
const PROPOSAL_LOOKUP_LIMIT: Duration = Duration::from_secs(14);
const PROPOSAL_LOOKUP_BACKOFF: Duration = Duration::from_millis(300);
const FIND_PROPOSAL_INTERVAL: Duration = Duration::from_secs(1);

/// Keeps a node under handover from broadcasting ballots past the INIT
/// voteproof it joined at
#[derive(Default)]
pub(super) struct HandoverGate {
    joined: RwLock<Option<Voteproof>>,
    after_joining: AtomicBool,
}

impl HandoverGate {
    pub(super) fn reset(&self) {
        *self.joined.write() = None;
        self.after_joining.store(false, Ordering::SeqCst);
    }

    pub(super) fn joined(&self) -> Option<Voteproof> {
        self.joined.read().clone()
    }

    pub(super) fn set_joined(&self, voteproof: &Voteproof) {
        *self.joined.write() = Some(voteproof.clone());
    }

    pub(super) fn after_joining(&self) -> bool {
        self.after_joining.load(Ordering::SeqCst)
    }

    pub(super) fn set_after_joining(&self) {
        self.after_joining.store(true, Ordering::SeqCst);
    }

    /// Broadcasting for `voteproof` is allowed up to the joined point
    fn allows(&self, ctx: &StatesContext, voteproof: &Voteproof) -> bool {
        if !ctx.under_handover() {
            return true;
        }
        match self.joined() {
            Some(joined) => voteproof.point() <= joined.point(),
            None => false,
        }
    }
}

pub(super) struct ConsensusBase {
    state: NodeState,
    pub(super) ctx: Arc<StatesContext>,
    /// Last INIT ballot this node broadcast
    last_init_ballot: Mutex<Option<Ballot>>,
    pub(super) gate: Option<HandoverGate>,
}

impl ConsensusBase {
    pub(super) fn new(state: NodeState, ctx: Arc<StatesContext>, gate: Option<HandoverGate>) -> Self {
        Self {
            state,
            ctx,
            last_init_ballot: Mutex::new(None),
            gate,
        }
    }

    fn last_init_ballot(&self) -> Option<Ballot> {
        self.last_init_ballot.lock().clone()
    }

    fn switch(&self, to: NodeState, voteproof: &Voteproof) -> StateSwitchContext {
        StateSwitchContext::new(self.state, to).with_voteproof(voteproof.clone())
    }

    /// Entering needs the INIT voteproof to start the round from
    pub(super) fn check_enter(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        let vp = sctx
            .voteproof()
            .ok_or_else(|| ConsensusError::invalid(format!("{} state not allowed to enter without voteproof", self.state)))?;
        if vp.stage != Stage::Init {
            return Err(ConsensusError::invalid(format!(
                "{} state not allowed to enter with {} voteproof",
                self.state, vp.stage
            )));
        }

        let livp = self
            .ctx
            .last_init_voteproof()
            .ok_or_else(|| ConsensusError::invalid("empty last init voteproof"))?;
        if vp.stage_point() != livp.stage_point() && vp.height != livp.height.next() {
            error!(
                voteproof = %vp.stage_point(),
                last_init_voteproof = %livp.stage_point(),
                "wrong height of voteproof for consensus; entering anyway"
            );
        }
        Ok(())
    }

    pub(super) async fn process_voteproof(&self, vp: &Voteproof) -> ConsensusResult<()> {
        if vp.result == VoteResult::Draw {
            debug!(voteproof = %vp.id(), "draw voteproof found; moves to next round");
            return self.next_round(vp).await;
        }

        match vp.stage {
            Stage::Init => self.new_init_voteproof(vp).await,
            Stage::Accept => self.new_accept_voteproof(vp).await,
            stage => Err(ConsensusError::ignore(format!("not supported voteproof stage, {}", stage))),
        }
    }

    async fn next_round(&self, vp: &Voteproof) -> ConsensusResult<()> {
        debug!(voteproof = %vp.stage_point(), "starting next round");

        let ctx = &self.ctx;
        let now = ctx.clock.now();
        let ballot = match vp.stage {
            Stage::Init => {
                next_init_from_init(ctx.database.as_ref(), &ctx.local, vp, None, &ctx.policy.network_id, now).await?
            }
            _ => next_init_from_accept(ctx.database.as_ref(), &ctx.local, vp, &ctx.policy.network_id, now).await?,
        };

        let interval = ctx.policy.interval_broadcasting_init_ballot();
        let timer = ctx.ballot_timer(TIMER_BROADCAST_INIT_BALLOT, ballot, true, true, move |i| {
            if i < 1 {
                MIN_INTERVAL
            } else {
                interval
            }
        });
        ctx.timers.set_timer(timer)?;
        ctx.timers.start_timers(&[TIMER_BROADCAST_INIT_BALLOT], true)
    }

    async fn new_init_voteproof(&self, vp: &Voteproof) -> ConsensusResult<()> {
        self.ctx.timers.stop_timers(&[TIMER_BROADCAST_PROPOSAL])?;

        self.handle_unknown_init(vp).await?;

        debug!(voteproof = %vp.id(), "processing new init voteproof; propose proposal");

        let proposer = self.ctx.suffrage.acting(vp.height, vp.round).proposer;

        let mut proposal = find_proposal(&self.ctx, vp.height, vp.round, &proposer).await?;
        if proposal.is_some() {
            debug!(voteproof = %vp.id(), "proposal found in local");
        } else if proposer == *self.ctx.local.address() {
            proposal = self.prepare_proposal(vp).await?;
        }

        match proposal {
            Some(p) => self.process_proposal(&p).await,
            None => self.when_proposal_timeout(vp, proposer).await,
        }
    }

    /// An INIT voteproof carrying an ACCEPT voteproof came from a ballot of
    /// a next round we never saw; join that round
    async fn handle_unknown_init(&self, vp: &Voteproof) -> ConsensusResult<()> {
        let accept = match vp.accept() {
            Some(accept) => accept.clone(),
            None => return Ok(()),
        };

        let ctx = &self.ctx;
        if let Some(lvp) = ctx.last_voteproof() {
            let wait = chrono::Duration::from_std(ctx.policy.timeout_waiting_proposal() * 3)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if lvp.finished_at > ctx.clock.now() - wait {
                debug!(voteproof = %vp.stage_point(), "next round voteproof too early; will wait");
                return Ok(());
            }
        }

        if let Some(last) = self.last_init_ballot() {
            if vp.point() < last.point() {
                return Ok(());
            }
        }

        debug!(voteproof = %vp.stage_point(), "next round voteproof found; will broadcast next round init ballot");

        let ballot = next_init_from_init(
            ctx.database.as_ref(),
            &ctx.local,
            vp,
            Some(accept),
            &ctx.policy.network_id,
            ctx.clock.now(),
        )
        .await?;
        *self.last_init_ballot.lock() = Some(ballot.clone());

        let interval = ctx.policy.interval_broadcasting_init_ballot();
        let timer = ctx.ballot_timer(TIMER_BROADCAST_INIT_BALLOT, ballot, true, true, move |i| {
            if i < 1 {
                MIN_INTERVAL
            } else {
                interval
            }
        });
        ctx.timers.set_timer(timer)?;
        ctx.timers.start_timers(&[TIMER_BROADCAST_INIT_BALLOT], true)
    }

    async fn prepare_proposal(&self, vp: &Voteproof) -> ConsensusResult<Option<Proposal>> {
        if self.ctx.under_handover() {
            debug!("under handover; will not make proposal");
            return Ok(None);
        }

        debug!(voteproof = %vp.id(), "local is proposer; preparing proposal");
        let proposal = self.ctx.proposal_maker.proposal(vp.height, vp.round, vp);
        store_proposal(self.ctx.database.as_ref(), &proposal).await?;

        debug!(
            proposal = %proposal.fact().hash(),
            operations = proposal.proposal_fact().map(|f| f.operations.len()).unwrap_or(0),
            "proposal made"
        );
        Ok(Some(proposal))
    }

    pub(super) async fn process_proposal(&self, proposal: &Proposal) -> ConsensusResult<()> {
        self.broadcast_proposal(proposal)?;

        let started = Instant::now();
        if let Some((vp, new_block, _)) = self.process(proposal).await {
            let delay = self
                .ctx
                .policy
                .wait_broadcasting_accept_ballot()
                .saturating_sub(started.elapsed())
                .max(MIN_INTERVAL);
            return self.broadcast_accept(new_block, proposal.fact().hash(), &vp, delay);
        }
        Ok(())
    }

    /// Build the block of `proposal`. `None` when the processor ignored it;
    /// a failure still votes, for a block hash nobody can build.
    async fn process(&self, proposal: &Proposal) -> Option<(Voteproof, Hash, bool)> {
        let vp = match (self.ctx.last_init_voteproof(), proposal.base_voteproof.as_ref()) {
            (Some(livp), Some(base)) if livp.point() != base.point() => base.clone(),
            (Some(livp), _) => livp,
            (None, Some(base)) => base.clone(),
            (None, None) => return None,
        };

        debug!(proposal = %proposal.fact().hash(), "processing proposal");
        let started = Instant::now();
        match self.ctx.processors.new_proposal(proposal, &vp).await {
            Ok(block) => {
                debug!(elapsed = ?started.elapsed(), new_block = %block.hash(), "proposal processed");
                Some((vp, block.hash(), true))
            }
            Err(e) if e.is_ignore() => None,
            Err(e) => {
                let new_block = failed_block_hash(&proposal.fact().hash());
                debug!(
                    error = %e,
                    elapsed = ?started.elapsed(),
                    new_block = %new_block,
                    "proposal processing failed; failed block hash will be used"
                );
                Some((vp, new_block, false))
            }
        }
    }

    fn broadcast_proposal(&self, proposal: &Proposal) -> ConsensusResult<()> {
        trace!(proposal = %proposal.point(), "broadcasting proposal");

        let ctx = &self.ctx;
        let resign = proposal.node() == ctx.local.address();
        let interval = ctx.policy.interval_broadcasting_proposal();
        let timer = ctx.ballot_timer(TIMER_BROADCAST_PROPOSAL, proposal.clone(), resign, false, move |i| {
            if i < 1 {
                MIN_INTERVAL
            } else {
                interval
            }
        });
        ctx.timers.set_timer(timer)?;
        ctx.timers.start_timers(
            &[TIMER_BROADCAST_PROPOSAL, TIMER_BROADCAST_INIT_BALLOT, TIMER_BROADCAST_ACCEPT_BALLOT],
            true,
        )
    }

    fn broadcast_accept(&self, new_block: Hash, proposal: Hash, vp: &Voteproof, delay: Duration) -> ConsensusResult<()> {
        if let Some(gate) = &self.gate {
            if !gate.allows(&self.ctx, vp) {
                debug!(voteproof = %vp.stage_point(), "under handover; accept ballot not broadcast");
                return Ok(());
            }
        }

        let ctx = &self.ctx;
        let ballot = Ballot::new(
            BallotFact::accept(vp.height, vp.round, proposal, new_block),
            Some(vp.clone()),
            None,
            &ctx.local,
            &ctx.policy.network_id,
            ctx.clock.now(),
        );
        debug!(ballot = %ballot.hash(), new_block = %new_block, delay = ?delay, "start timer to broadcast accept ballot");

        let interval = ctx.policy.interval_broadcasting_accept_ballot();
        let timer = ctx.ballot_timer(TIMER_BROADCAST_ACCEPT_BALLOT, ballot, true, true, move |i| {
            if i < 1 {
                delay
            } else {
                interval
            }
        });
        ctx.timers.set_timer(timer)?;
        ctx.timers.start_timers(
            &[TIMER_BROADCAST_INIT_BALLOT, TIMER_BROADCAST_PROPOSAL, TIMER_BROADCAST_ACCEPT_BALLOT],
            true,
        )
    }

    async fn new_accept_voteproof(&self, vp: &Voteproof) -> ConsensusResult<()> {
        self.process_accept(vp).await?;
        self.broadcast_new_init(vp).await
    }

    async fn process_accept(&self, vp: &Voteproof) -> ConsensusResult<()> {
        let fact = vp
            .majority_accept()
            .ok_or_else(|| ConsensusError::invalid("accept voteproof without accept majority"))?;

        debug!(
            voteproof = %vp.id(),
            proposal = %fact.proposal,
            new_block = %fact.new_block,
            "processing accept voteproof"
        );

        let started = Instant::now();
        let proposal = self.proposal_of_accept(vp, fact).await?;
        self.broadcast_proposal(&proposal)?;

        // no timeout on storing a block
        match self.ctx.processors.save(&fact.proposal, vp).await {
            Ok(block) => {
                info!(
                    height = %block.manifest.height,
                    round = %block.manifest.round,
                    block = %block.hash(),
                    elapsed = ?started.elapsed(),
                    "new block stored"
                );
                self.ctx.new_blocks(vec![block]);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to save block from accept voteproof; moves to syncing");
                Err(self.switch(NodeState::Syncing, vp).with_error(e).into_error())
            }
        }
    }

    /// The proposal an ACCEPT majority agreed on, processed if it was not
    async fn proposal_of_accept(&self, vp: &Voteproof, fact: &AcceptFact) -> ConsensusResult<Proposal> {
        let proposal = proposal_with_retry(
            self.ctx.database.as_ref(),
            &fact.proposal,
            PROPOSAL_LOOKUP_LIMIT,
            PROPOSAL_LOOKUP_BACKOFF,
        )
        .await?
        .ok_or_else(|| ConsensusError::not_found("proposal of accept voteproof not found in local"))?;

        let state = self.ctx.processors.current_state(&fact.proposal);
        if state.is_processed() {
            trace!(voteproof = %vp.id(), state = %state, "proposal of accept voteproof already processed");
            return Ok(proposal);
        }

        debug!(state = %state, "proposal of accept voteproof not yet processed, process it");
        if let Some((_, _, true)) = self.process(&proposal).await {
            return Ok(proposal);
        }

        match self.ctx.processors.current_state(&fact.proposal) {
            s if s.is_processed() => Ok(proposal),
            s => Err(ConsensusError::invalid(format!(
                "failed to process proposal of accept voteproof; {}",
                s
            ))),
        }
    }

    async fn broadcast_new_init(&self, vp: &Voteproof) -> ConsensusResult<()> {
        if let Some(gate) = &self.gate {
            if !gate.allows(&self.ctx, vp) {
                debug!(voteproof = %vp.stage_point(), "under handover; new init ballot not broadcast");
                return Ok(());
            }
        }

        let ctx = &self.ctx;
        let mut ballot =
            next_init_from_accept(ctx.database.as_ref(), &ctx.local, vp, &ctx.policy.network_id, ctx.clock.now())
                .await?;
        {
            let mut last = self.last_init_ballot.lock();
            match last.as_ref() {
                Some(l) if l.fact().hash() == ballot.fact().hash() => ballot = l.clone(),
                _ => *last = Some(ballot.clone()),
            }
        }

        debug!(height = %ballot.height(), round = %ballot.round(), "broadcasting new init ballot");

        let interval = ctx.policy.interval_broadcasting_init_ballot();
        let timer = ctx.ballot_timer(TIMER_BROADCAST_INIT_BALLOT, ballot, true, true, move |_| interval);
        ctx.timers.set_timer(timer)?;
        ctx.timers.start_timers(
            &[TIMER_BROADCAST_INIT_BALLOT, TIMER_BROADCAST_PROPOSAL, TIMER_BROADCAST_ACCEPT_BALLOT],
            true,
        )
    }

    /// No proposal yet: look for it every second, and move to the next
    /// round when the wait runs out
    async fn when_proposal_timeout(&self, vp: &Voteproof, proposer: Address) -> ConsensusResult<()> {
        debug!(voteproof = %vp.stage_point(), "waiting new proposal; if timed out, will move to next round");

        let ctx = &self.ctx;
        let ballot =
            next_init_from_init(ctx.database.as_ref(), &ctx.local, vp, None, &ctx.policy.network_id, ctx.clock.now())
                .await?;
        *self.last_init_ballot.lock() = Some(ballot.clone());

        let timeout = ctx.policy.timeout_waiting_proposal();
        let interval = ctx.policy.interval_broadcasting_init_ballot();
        let timer = ctx.ballot_timer(TIMER_BROADCAST_INIT_BALLOT, ballot, true, true, move |i| {
            if i < 1 {
                timeout
            } else {
                interval
            }
        });
        ctx.timers.set_timer(timer)?;

        let weak = Arc::downgrade(ctx);
        let (height, round) = (vp.height, vp.round);
        let finder = ContextTimer::new(TIMER_FIND_PROPOSAL, FIND_PROPOSAL_INTERVAL, move |_| {
            let weak = weak.clone();
            let proposer = proposer.clone();
            async move {
                let ctx = match weak.upgrade() {
                    Some(ctx) => ctx,
                    None => return Ok(false),
                };
                if let Ok(Some(p)) = find_proposal(&ctx, height, round, &proposer).await {
                    debug!(height = %height, round = %round, "proposal found in local");
                    ctx.new_proposal(p);
                }
                Ok(true)
            }
        });
        ctx.timers.set_timer(finder)?;

        ctx.timers.start_timers(
            &[TIMER_BROADCAST_INIT_BALLOT, TIMER_BROADCAST_PROPOSAL, TIMER_FIND_PROPOSAL],
            true,
        )
    }
}

/// Stored proposal of a point, retrying over transient storage errors
async fn find_proposal(
    ctx: &StatesContext,
    height: Height,
    round: Round,
    proposer: &Address,
) -> ConsensusResult<Option<Proposal>> {
    let deadline = Instant::now() + PROPOSAL_LOOKUP_LIMIT;
    loop {
        match ctx.database.proposal_by_point(height, round, proposer).await {
            Err(e) if e.is_connection() && Instant::now() + PROPOSAL_LOOKUP_BACKOFF < deadline => {
                warn!(error = %e, "failed to find proposal; retrying");
                tokio::time::sleep(PROPOSAL_LOOKUP_BACKOFF).await;
            }
            other => return Ok(other?),
        }
    }
}

pub(super) struct ConsensusState {
    base: ConsensusBase,
}

impl ConsensusState {
    pub(super) fn new(ctx: Arc<StatesContext>) -> Self {
        Self {
            base: ConsensusBase::new(NodeState::Consensus, ctx, None),
        }
    }
}

#[async_trait]
impl State for ConsensusState {
    fn state(&self) -> NodeState {
        NodeState::Consensus
    }

    async fn enter(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        self.base.check_enter(sctx)
    }

    async fn entered(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        match sctx.voteproof() {
            Some(vp) => self.base.process_voteproof(vp).await,
            None => Ok(()),
        }
    }

    async fn exit(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        self.base.ctx.timers.stop_timers(&[
            TIMER_BROADCAST_INIT_BALLOT,
            TIMER_BROADCAST_PROPOSAL,
            TIMER_FIND_PROPOSAL,
            TIMER_BROADCAST_ACCEPT_BALLOT,
        ])
    }

    async fn process_voteproof(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        self.base.process_voteproof(voteproof).await
    }

    async fn process_proposal(&self, proposal: &Proposal) -> ConsensusResult<()> {
        self.base.process_proposal(proposal).await
    }
}
