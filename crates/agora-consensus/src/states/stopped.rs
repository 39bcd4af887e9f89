//! Stopped state: the node does nothing until it is booted again.

use async_trait::async_trait;
use std::sync::Arc;

use agora_core::NodeState;

use crate::error::ConsensusResult;
use crate::voteproof::Voteproof;

use super::context::StatesContext;
use super::{State, StateSwitchContext};

pub(super) struct StoppedState {
    ctx: Arc<StatesContext>,
}

impl StoppedState {
    pub(super) fn new(ctx: Arc<StatesContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl State for StoppedState {
    fn state(&self) -> NodeState {
        NodeState::Stopped
    }

    async fn enter(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        self.ctx.timers.stop_all();
        Ok(())
    }

    async fn exit(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        Ok(())
    }

    async fn process_voteproof(&self, _voteproof: &Voteproof) -> ConsensusResult<()> {
        Ok(())
    }
}
