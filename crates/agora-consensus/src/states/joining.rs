//! Joining state
//!
//! The node knows its last block and tries to get into the running round:
//! it keeps broadcasting the INIT ballot that follows its last ACCEPT
//! voteproof until an INIT voteproof shows up, then moves to consensus.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use agora_core::{NodeState, Stage};

use crate::ballot::Seal;
use crate::error::{ConsensusError, ConsensusResult};
use crate::timer::{ContextTimer, MIN_INTERVAL};
use crate::voteproof::{compare_voteproof, Voteproof};

use super::ballot::next_init_from_accept;
use super::context::{StatesContext, RESIGN_EVERY};
use super::{switch_to, State, StateSwitchContext, TIMER_BROADCAST_JOINING_INIT_BALLOT};

/// First broadcast waits this many INIT intervals for incoming ballots
const FIRST_WAIT_INTERVALS: u32 = 5;

pub(super) struct JoiningState {
    ctx: Arc<StatesContext>,
}

impl JoiningState {
    pub(super) fn new(ctx: Arc<StatesContext>) -> Self {
        Self { ctx }
    }

    async fn start_broadcasting(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        if self.ctx.under_handover() {
            return Ok(());
        }

        let ctx = &self.ctx;
        let ballot =
            next_init_from_accept(ctx.database.as_ref(), &ctx.local, voteproof, &ctx.policy.network_id, ctx.clock.now())
                .await?;
        debug!(voteproof = %voteproof.id(), "joining with latest accept voteproof from local");

        // a standalone node has nobody to wait for
        let standalone = ctx.suffrage.nodes().len() < 2;
        let interval = ctx.policy.interval_broadcasting_init_ballot();

        let timer = if standalone {
            ctx.ballot_timer(TIMER_BROADCAST_JOINING_INIT_BALLOT, ballot, true, true, move |i| {
                if i < 1 {
                    MIN_INTERVAL
                } else {
                    interval
                }
            })
        } else {
            self.joining_timer(ballot)
        };

        ctx.timers.set_timer(timer)?;
        ctx.timers.start_timers(&[TIMER_BROADCAST_JOINING_INIT_BALLOT], true)
    }

    /// Broadcasts like the plain ballot timer, but first looks in the
    /// ballotbox for a voteproof newer than ours carried by someone's ballot
    fn joining_timer(&self, ballot: crate::ballot::Ballot) -> ContextTimer {
        let weak = Arc::downgrade(&self.ctx);
        let ballot = Arc::new(Mutex::new(ballot));
        let injected: Arc<Mutex<Option<Voteproof>>> = Arc::new(Mutex::new(None));
        let interval = self.ctx.policy.interval_broadcasting_init_ballot();

        ContextTimer::new(TIMER_BROADCAST_JOINING_INIT_BALLOT, interval, move |i| {
            let weak = weak.clone();
            let ballot = ballot.clone();
            let injected = injected.clone();
            async move {
                let ctx = match weak.upgrade() {
                    Some(ctx) => ctx,
                    None => return Ok(false),
                };

                if let Some(vp) = ctx.ballotbox.latest_carried_voteproof() {
                    let mut last = injected.lock();
                    if compare_voteproof(Some(&vp), ctx.last_voteproof().as_ref()) == Ordering::Greater
                        && compare_voteproof(Some(&vp), last.as_ref()) == Ordering::Greater
                    {
                        *last = Some(vp.clone());
                        debug!(voteproof = %vp.stage_point(), "newer voteproof found in ballotbox");
                        ctx.new_voteproof(vp);
                    }
                }

                let seal = {
                    let mut b = ballot.lock();
                    if i > 0 && i % RESIGN_EVERY == 0 {
                        b.resign(&ctx.local, &ctx.policy.network_id, ctx.clock.now());
                    }
                    Seal::Ballot(b.clone())
                };
                ctx.broadcast(seal, i == 0);
                Ok(true)
            }
        })
        .with_interval(move |i| if i < 1 { interval * FIRST_WAIT_INTERVALS } else { interval })
    }
}

#[async_trait]
impl State for JoiningState {
    fn state(&self) -> NodeState {
        NodeState::Joining
    }

    async fn enter(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        Ok(())
    }

    async fn entered(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        let voteproof = match sctx.voteproof() {
            Some(vp) => vp.clone(),
            None => self
                .ctx
                .database
                .last_voteproof(Stage::Accept)
                .await?
                .ok_or_else(|| ConsensusError::not_found("last accept voteproof not found"))?,
        };

        if voteproof.stage != Stage::Accept {
            return self.process_voteproof(&voteproof).await;
        }
        self.start_broadcasting(&voteproof).await
    }

    async fn exit(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        self.ctx.timers.stop_timers(&[TIMER_BROADCAST_JOINING_INIT_BALLOT])
    }

    async fn process_voteproof(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        if voteproof.stage != Stage::Init {
            return Ok(());
        }

        self.ctx.timers.stop_timers(&[TIMER_BROADCAST_JOINING_INIT_BALLOT])?;
        Err(switch_to(NodeState::Joining, NodeState::Consensus, Some(voteproof)))
    }
}
