//! Block syncing collaborator
//!
//! A syncing node asks its peers for the blocks between its last manifest
//! and a target height. The consensus core only extends the target and
//! listens for progress; fetching and storing blocks is up to the
//! implementation.

use async_trait::async_trait;
use std::sync::Arc;

use agora_core::{Address, Height};

use crate::database::Manifest;
use crate::error::ConsensusResult;
use crate::network::Channel;
use crate::processor::Block;

/// Peer to fetch blocks from
pub type SyncSource = (Address, Arc<dyn Channel>);

pub type BlockSavedHook = Arc<dyn Fn(Vec<Block>) + Send + Sync>;
pub type FinishedHook = Arc<dyn Fn(Height) + Send + Sync>;

#[async_trait]
pub trait Syncers: Send + Sync {
    /// Extend the target height to `to`. Returns whether syncing had
    /// finished before this call; a target not above the current one fails
    /// with `Ignore`.
    async fn add(&self, to: Height, sources: Vec<SyncSource>) -> ConsensusResult<bool>;

    fn is_finished(&self) -> bool;

    fn set_when_block_saved(&self, hook: BlockSavedHook);

    fn set_when_finished(&self, hook: FinishedHook);

    async fn stop(&self) -> ConsensusResult<()>;
}

/// Builds a fresh [`Syncers`] each time the node starts syncing
pub trait SyncersFactory: Send + Sync {
    fn new_syncers(&self, base: Option<Manifest>) -> ConsensusResult<Arc<dyn Syncers>>;
}
