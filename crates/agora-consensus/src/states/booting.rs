//! Booting state: checks the local chain and decides where to go next.
//!
//! A node with blocks joins when it is in the suffrage and syncs otherwise;
//! a node without blocks can only sync, and only when it has someone to
//! sync from.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use agora_core::NodeState;

use crate::error::{ConsensusError, ConsensusResult};
use crate::voteproof::Voteproof;

use super::context::StatesContext;
use super::{switch_to, State, StateSwitchContext};

pub(super) struct BootingState {
    ctx: Arc<StatesContext>,
}

impl BootingState {
    pub(super) fn new(ctx: Arc<StatesContext>) -> Self {
        Self { ctx }
    }

    async fn next_state(&self) -> ConsensusResult<NodeState> {
        match self.ctx.database.check_block(&self.ctx.policy.network_id).await {
            Ok(blocks) => {
                info!(blocks, "local blocks checked");
                if self.ctx.is_local_in_suffrage() {
                    Ok(NodeState::Joining)
                } else {
                    debug!("local is not in suffrage; moves to syncing");
                    Ok(NodeState::Syncing)
                }
            }
            Err(e) if e.is_not_found() => {
                if self.ctx.syncable_channels().is_empty() {
                    return Err(ConsensusError::invalid(
                        "empty blocks, but no channels for syncing; can not sync",
                    ));
                }
                info!("empty blocks found; moves to syncing");
                Ok(NodeState::Syncing)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl State for BootingState {
    fn state(&self) -> NodeState {
        NodeState::Booting
    }

    async fn enter(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        Ok(())
    }

    async fn entered(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        let to = self.next_state().await?;
        Err(switch_to(NodeState::Booting, to, None))
    }

    async fn exit(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        Ok(())
    }

    async fn process_voteproof(&self, _voteproof: &Voteproof) -> ConsensusResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::ballot::tests::ChainDatabase;
    use super::super::context::tests::{context, context_of, IdleProcessors, NoSyncers};
    use super::*;
    use crate::network::tests::RecordingChannel;
    use crate::test_utils::*;
    use agora_core::Height;

    fn entering() -> StateSwitchContext {
        StateSwitchContext::new(NodeState::Stopped, NodeState::Booting)
    }

    async fn booted_to(st: &BootingState) -> NodeState {
        let err = st.entered(&entering()).await.unwrap_err();
        let sctx = err.into_switch_context().unwrap();
        assert_eq!(sctx.from(), NodeState::Booting);
        sctx.to()
    }

    #[tokio::test]
    async fn test_with_blocks_joins() {
        let nodes = test_nodes(3);
        let db = Arc::new(ChainDatabase::default().with_block(Height::GENESIS, genesis_hash()));
        let (ctx, _queues) = context(&nodes, 0, db);

        assert_eq!(booted_to(&BootingState::new(ctx)).await, NodeState::Joining);
    }

    #[tokio::test]
    async fn test_outside_suffrage_syncs() {
        let nodes = test_nodes(3);
        let db = Arc::new(ChainDatabase::default().with_block(Height::GENESIS, genesis_hash()));
        let (ctx, _queues) = context_of(
            &nodes[..2],
            nodes[2].clone(),
            db,
            Arc::new(IdleProcessors),
            Arc::new(NoSyncers),
        );

        assert_eq!(booted_to(&BootingState::new(ctx)).await, NodeState::Syncing);
    }

    #[tokio::test]
    async fn test_empty_blocks_with_channels_syncs() {
        let nodes = test_nodes(3);
        let (ctx, _queues) = context(&nodes, 0, Arc::new(ChainDatabase::default()));
        ctx.nodepool.set_channel(nodes[1].address(), Some(RecordingChannel::new("n1"))).unwrap();

        assert_eq!(booted_to(&BootingState::new(ctx)).await, NodeState::Syncing);
    }

    #[tokio::test]
    async fn test_empty_blocks_without_channels_fails() {
        let nodes = test_nodes(3);
        let (ctx, _queues) = context(&nodes, 0, Arc::new(ChainDatabase::default()));

        let err = BootingState::new(ctx).entered(&entering()).await.unwrap_err();
        assert!(err.into_switch_context().is_err());
    }
}
