//! # Consensus States
//!
//! A node is always in exactly one state. States never switch on their own;
//! they return a [`StateSwitchContext`] wrapped in
//! [`ConsensusError::SwitchState`] and the machine performs the switch.
//!
//! ```text
//!              ┌──────────┐
//!              │ Stopped  │
//!              └────┬─────┘
//!                   ▼
//!              ┌──────────┐  empty blocks, peers
//!              │ Booting  │─────────────────────┐
//!              └────┬─────┘                     ▼
//!                   ▼                      ┌──────────┐
//!              ┌──────────┐  no voteproof  │ Syncing  │
//!              │ Joining  │◄───────────────┤          │
//!              └────┬─────┘                └──────────┘
//!         INIT vp   ▼                        ▲     │ caught up
//!              ┌──────────┐  behind / save   │     │
//!              │Consensus │──────────────────┘     │
//!              └──────────┘◄───────────────────────┘
//!                   ▲
//!              ┌────┴─────┐
//!              │ Handover │  promoted after joining
//!              └──────────┘
//! ```
//!
//! Each switch runs `exit` on the old state, `enter` on the new one, then
//! the new state's `entered` callback.

mod ballot;
mod booting;
mod consensus;
mod context;
mod handover;
mod joining;
mod machine;
mod stopped;
mod syncing;

pub use ballot::{next_init_from_accept, next_init_from_init, OperationsSource, ProposalMaker};
pub use context::StatesContext;
pub use machine::{StateMachine, StateMachineBuilder};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agora_core::{AgoraError, NodeState};

use crate::ballot::Proposal;
use crate::error::{ConsensusError, ConsensusResult};
use crate::processor::Block;
use crate::timer::TimerId;
use crate::voteproof::Voteproof;

pub const TIMER_BROADCAST_INIT_BALLOT: TimerId = "broadcast-init-ballot";
pub const TIMER_BROADCAST_JOINING_INIT_BALLOT: TimerId = "broadcast-joining-init-ballot";
pub const TIMER_BROADCAST_PROPOSAL: TimerId = "broadcast-proposal";
pub const TIMER_BROADCAST_ACCEPT_BALLOT: TimerId = "broadcast-accept-ballot";
pub const TIMER_FIND_PROPOSAL: TimerId = "find-proposal";
pub const TIMER_SYNCING_WAIT_VOTEPROOF: TimerId = "syncing-wait-voteproof";

pub const ALL_TIMERS: [TimerId; 6] = [
    TIMER_BROADCAST_INIT_BALLOT,
    TIMER_BROADCAST_JOINING_INIT_BALLOT,
    TIMER_BROADCAST_PROPOSAL,
    TIMER_BROADCAST_ACCEPT_BALLOT,
    TIMER_FIND_PROPOSAL,
    TIMER_SYNCING_WAIT_VOTEPROOF,
];

/// Request to move the machine from one state to another
#[derive(Clone, Debug)]
pub struct StateSwitchContext {
    from: NodeState,
    to: NodeState,
    voteproof: Option<Voteproof>,
    error: Option<Arc<ConsensusError>>,
    allow_empty: bool,
}

impl StateSwitchContext {
    pub fn new(from: NodeState, to: NodeState) -> Self {
        Self {
            from,
            to,
            voteproof: None,
            error: None,
            allow_empty: false,
        }
    }

    pub fn with_voteproof(mut self, voteproof: Voteproof) -> Self {
        self.voteproof = Some(voteproof);
        self
    }

    pub fn with_error(mut self, error: ConsensusError) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    pub fn with_from(mut self, from: NodeState) -> Self {
        self.from = from;
        self
    }

    pub fn with_to(mut self, to: NodeState) -> Self {
        self.to = to;
        self
    }

    /// Let `from` stay unknown; the machine fills in its current state
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn from(&self) -> NodeState {
        self.from
    }

    pub fn to(&self) -> NodeState {
        self.to
    }

    pub fn voteproof(&self) -> Option<&Voteproof> {
        self.voteproof.as_ref()
    }

    pub fn error(&self) -> Option<&ConsensusError> {
        self.error.as_deref()
    }

    pub fn is_valid(&self) -> agora_core::Result<()> {
        if self.to == NodeState::Unknown {
            return Err(AgoraError::invalid("empty target state"));
        }
        if self.from == NodeState::Unknown && !self.allow_empty {
            return Err(AgoraError::invalid("empty source state"));
        }
        self.to.is_valid()?;
        if self.from != NodeState::Unknown {
            self.from.is_valid()?;
        }
        if self.from == self.to && self.voteproof.is_none() {
            return Err(AgoraError::invalid(format!("same state, {}, without voteproof", self.to)));
        }
        Ok(())
    }

    /// Wrap into the error form states return
    pub fn into_error(self) -> ConsensusError {
        ConsensusError::switch(self)
    }
}

impl fmt::Display for StateSwitchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)?;
        if let Some(vp) = &self.voteproof {
            write!(f, " with {}", vp.stage_point())?;
        }
        if let Some(e) = &self.error {
            write!(f, " ({})", e)?;
        }
        Ok(())
    }
}

/// Notifications published by the machine
#[derive(Clone, Debug)]
pub enum StateEvent {
    StateChanged { from: NodeState, to: NodeState },
    NewBlocks(Vec<Block>),
    ConsensusStuck,
    ConsensusReleased,
}

/// Machine-level knobs; consensus timing lives in the policy
#[derive(Clone, Debug)]
pub struct StatesConfig {
    pub clean_ballotbox_interval: Duration,
    pub stuck_check_interval: Duration,
    pub stuck_endure: Duration,
    /// Capacity of the switch, voteproof and proposal channels
    pub channel_capacity: usize,
    pub events_capacity: usize,
    /// Pause before retrying a failed switch through booting
    pub booting_retry_delay: Duration,
}

impl Default for StatesConfig {
    fn default() -> Self {
        Self {
            clean_ballotbox_interval: Duration::from_secs(10),
            stuck_check_interval: Duration::from_secs(3),
            stuck_endure: Duration::from_secs(60),
            channel_capacity: 33,
            events_capacity: 256,
            booting_retry_delay: Duration::from_secs(1),
        }
    }
}

/// One node state
///
/// `enter` runs before the machine records the new state and may refuse it;
/// `entered` runs right after. Any method may return
/// [`ConsensusError::SwitchState`] to ask for another switch.
#[async_trait]
pub trait State: Send + Sync {
    fn state(&self) -> NodeState;

    async fn enter(&self, sctx: &StateSwitchContext) -> ConsensusResult<()>;

    async fn entered(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        Ok(())
    }

    async fn exit(&self, sctx: &StateSwitchContext) -> ConsensusResult<()>;

    async fn process_voteproof(&self, voteproof: &Voteproof) -> ConsensusResult<()>;

    async fn process_proposal(&self, _proposal: &Proposal) -> ConsensusResult<()> {
        Ok(())
    }
}

/// Switch request from `from` as an error
pub(crate) fn switch_to(from: NodeState, to: NodeState, voteproof: Option<&Voteproof>) -> ConsensusError {
    let mut sctx = StateSwitchContext::new(from, to);
    if let Some(vp) = voteproof {
        sctx = sctx.with_voteproof(vp.clone());
    }
    sctx.into_error()
}
