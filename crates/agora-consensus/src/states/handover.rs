//! # Handover State
//!
//! A new process taking over a validator runs the consensus rounds like
//! any node, but keeps quiet past the first INIT voteproof it joined at.
//! Once the rounds move beyond that point it is promoted to consensus and
//! tells the old process to stop.
//!
//! ```text
//!   enter ─► joined INIT vp (jivp) ─► passthrough to old node: only jivp INIT ballots
//!                    │
//!   INIT vp > jivp ──┴─► CONSENSUS, send EndHandover, drop passthrough
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};

use agora_core::{NodeState, Stage};

use crate::ballot::{Proposal, Seal};
use crate::error::{ConsensusError, ConsensusResult};
use crate::handover::HandoverSealKind;
use crate::network::PassthroughFilter;
use crate::voteproof::Voteproof;

use super::consensus::{ConsensusBase, HandoverGate};
use super::context::StatesContext;
use super::{
    State, StateSwitchContext, TIMER_BROADCAST_ACCEPT_BALLOT, TIMER_BROADCAST_INIT_BALLOT, TIMER_BROADCAST_PROPOSAL,
    TIMER_FIND_PROPOSAL,
};

pub(super) struct HandoverState {
    base: ConsensusBase,
}

impl HandoverState {
    pub(super) fn new(ctx: Arc<StatesContext>) -> Self {
        Self {
            base: ConsensusBase::new(NodeState::Handover, ctx, Some(HandoverGate::default())),
        }
    }

    fn ctx(&self) -> &Arc<StatesContext> {
        &self.base.ctx
    }

    fn gate(&self) -> Option<&HandoverGate> {
        self.base.gate.as_ref()
    }

    /// Promote to consensus when the rounds moved past the joined INIT
    /// voteproof
    fn can_move_consensus(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        let gate = match self.gate() {
            Some(gate) if gate.after_joining() => gate,
            _ => return Ok(()),
        };

        if !self.ctx().under_handover() {
            return Err(self.to_consensus(voteproof));
        }

        if voteproof.stage != Stage::Init {
            return Ok(());
        }

        let joined = match gate.joined() {
            Some(joined) => joined,
            None => {
                gate.set_joined(voteproof);
                self.filter_old_node(voteproof)?;
                debug!(voteproof = %voteproof.stage_point(), "joined init voteproof set");
                return Ok(());
            }
        };

        if voteproof.point() < joined.point() {
            return Ok(());
        }
        if voteproof.height == joined.height && voteproof.round <= joined.round {
            return Ok(());
        }

        info!(
            voteproof = %voteproof.stage_point(),
            joined = %joined.stage_point(),
            "new init voteproof after joined; moves to consensus"
        );
        Err(self.to_consensus(voteproof))
    }

    fn to_consensus(&self, voteproof: &Voteproof) -> ConsensusError {
        ConsensusError::switch(
            StateSwitchContext::new(NodeState::Handover, NodeState::Consensus).with_voteproof(voteproof.clone()),
        )
    }

    /// Only the INIT ballots of the joined point go to the old node
    fn filter_old_node(&self, joined: &Voteproof) -> ConsensusResult<()> {
        let old = match self.ctx().old_node() {
            Some(old) => old,
            None => return Ok(()),
        };

        let (height, round) = (joined.height, joined.round);
        let filter: PassthroughFilter = Arc::new(move |seal: &Seal| match seal {
            Seal::Ballot(b) => b.stage() == Stage::Init && b.height() == height && b.round() == round,
            _ => true,
        });

        Ok(self.ctx().nodepool.set_passthrough(old, Some(filter))?)
    }

    /// Tell the old node to stop and leave handover behind
    async fn finish(&self) -> ConsensusResult<()> {
        let ctx = self.ctx();
        let hd = match &ctx.handover {
            Some(hd) => hd.clone(),
            None => return Ok(()),
        };
        let old = hd.old_node();

        if let Some(old) = &old {
            let seal = hd.seal(HandoverSealKind::End);
            match old.end_handover(&seal).await {
                Ok(true) => info!(old_node = %old.conn_info(), "handover finished"),
                Ok(false) => error!(old_node = %old.conn_info(), "old node refused to end handover"),
                Err(e) => error!(old_node = %old.conn_info(), error = %e, "failed to end handover"),
            }
        }

        if let Err(e) = hd.stop().await {
            if !e.is_daemon_already_stopped() {
                return Err(e);
            }
        }

        if let Some(old) = old {
            if let Err(e) = ctx.nodepool.remove_passthrough(old.conn_info()) {
                if !e.is_not_found() {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl State for HandoverState {
    fn state(&self) -> NodeState {
        NodeState::Handover
    }

    async fn enter(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        let ctx = self.ctx();
        if !ctx.is_local_in_suffrage() || !ctx.under_handover() {
            debug!("not under handover; moves to consensus");
            let mut to = StateSwitchContext::new(NodeState::Handover, NodeState::Consensus);
            if let Some(vp) = sctx.voteproof() {
                to = to.with_voteproof(vp.clone());
            }
            return Err(ConsensusError::switch(to));
        }

        if let Some(gate) = self.gate() {
            gate.reset();
        }
        self.base.check_enter(sctx)
    }

    async fn entered(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        if let Some(vp) = sctx.voteproof() {
            self.base.process_voteproof(vp).await?;
        }

        if !self.ctx().is_joined() {
            self.ctx().join_discovery().await?;
        }

        if let Some(gate) = self.gate() {
            gate.set_after_joining();
        }
        Ok(())
    }

    async fn exit(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        if let Some(gate) = self.gate() {
            gate.reset();
        }

        if sctx.to() == NodeState::Consensus {
            self.finish().await?;
        }

        self.ctx().timers.stop_timers(&[
            TIMER_BROADCAST_INIT_BALLOT,
            TIMER_BROADCAST_PROPOSAL,
            TIMER_FIND_PROPOSAL,
            TIMER_BROADCAST_ACCEPT_BALLOT,
        ])
    }

    async fn process_voteproof(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        self.can_move_consensus(voteproof)?;
        self.base.process_voteproof(voteproof).await
    }

    async fn process_proposal(&self, proposal: &Proposal) -> ConsensusResult<()> {
        self.base.process_proposal(proposal).await
    }
}
