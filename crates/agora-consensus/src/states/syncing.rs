//! # Syncing State
//!
//! The node is behind; it does not vote and lets the [`Syncers`] fetch the
//! missing blocks. Voteproofs keep arriving and only move the sync target.
//!
//! ```text
//!   INIT vp h   ─► local < h-1 ─► target h-1
//!               └► local = h-1, finished ─► CONSENSUS
//!   ACCEPT vp h ─► local < h   ─► target h
//!   finished, no voteproof for a while ─► JOINING
//! ```
//!
//! A node outside the suffrage never sees voteproofs, so it polls the node
//! info of its peers for their last height instead.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use agora_core::{Height, NodeState, Stage};

use crate::error::{ConsensusError, ConsensusResult};
use crate::processor::Block;
use crate::syncer::{SyncSource, Syncers};
use crate::timer::ContextTimer;
use crate::voteproof::Voteproof;

use super::context::StatesContext;
use super::{State, StateSwitchContext, TIMER_SYNCING_WAIT_VOTEPROOF};

/// Interval of the wait timer after its first firing
const WAIT_VOTEPROOF_INTERVAL: Duration = Duration::from_secs(1);
/// Polling interval of the peers' node info when outside the suffrage
const NODE_INFO_CHECK_INTERVAL: Duration = Duration::from_secs(3);

struct Inner {
    ctx: Arc<StatesContext>,
    syncers: RwLock<Option<Arc<dyn Syncers>>>,
    exiting: AtomicBool,
    /// Serializes voteproofs and new heights
    lock: tokio::sync::Mutex<()>,
}

pub(super) struct SyncingState {
    inner: Arc<Inner>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncingState {
    pub(super) fn new(ctx: Arc<StatesContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                syncers: RwLock::new(None),
                exiting: AtomicBool::new(false),
                lock: tokio::sync::Mutex::new(()),
            }),
            checker: Mutex::new(None),
        }
    }

    async fn start_syncers(&self) -> ConsensusResult<()> {
        let inner = &self.inner;
        let base = inner.ctx.database.last_manifest().await?;
        let base_height = base.as_ref().map(|m| m.height);

        let syncers = inner.ctx.syncers.new_syncers(base)?;

        let weak = Arc::downgrade(inner);
        syncers.set_when_block_saved(Arc::new(move |blocks| {
            if let Some(inner) = weak.upgrade() {
                inner.when_block_saved(blocks);
            }
        }));

        let weak = Arc::downgrade(inner);
        syncers.set_when_finished(Arc::new(move |height| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move { inner.when_finished(height).await });
            }
        }));

        *inner.syncers.write() = Some(syncers);
        debug!(base_height = ?base_height, "new syncers started");
        Ok(())
    }

    fn start_node_info_checker(&self) {
        let ctx = &self.inner.ctx;
        if ctx.is_local_in_suffrage() && !ctx.under_handover() {
            return;
        }
        debug!("local is not in suffrage; node info checker started");

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(NODE_INFO_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if let Some(height) = inner.highest_remote_height().await {
                    if let Err(e) = inner.when_new_height(height).await {
                        error!(height = %height, error = %e, "failed to sync to new height");
                    }
                }
            }
        });

        if let Some(old) = self.checker.lock().replace(handle) {
            old.abort();
        }
    }
}

impl Inner {
    fn syncers(&self) -> Option<Arc<dyn Syncers>> {
        self.syncers.read().clone()
    }

    fn when_block_saved(&self, mut blocks: Vec<Block>) {
        if blocks.is_empty() {
            error!("empty saved blocks from syncers");
            return;
        }

        blocks.sort_by_key(|b| b.manifest.height);
        if let Some(ivp) = blocks.last().and_then(|b| b.init_voteproof.as_ref()) {
            self.ctx.set_last_voteproof(ivp);
        }
        self.ctx.new_blocks(blocks);
    }

    async fn when_finished(self: Arc<Self>, height: Height) {
        match self.ctx.database.last_voteproof(Stage::Accept).await {
            Ok(Some(vp)) => {
                self.ctx.set_last_voteproof(&vp);
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to load last accept voteproof"),
        }

        if self.ctx.is_local_in_suffrage() {
            debug!(height = %height, "syncing finished; waiting new voteproof");
            if let Err(e) = self.wait_voteproof() {
                error!(timer = TIMER_SYNCING_WAIT_VOTEPROOF, error = %e, "failed to start timer");
            }
        }
    }

    async fn local_height(&self) -> ConsensusResult<Height> {
        Ok(self
            .ctx
            .database
            .last_manifest()
            .await?
            .map(|m| m.height)
            .unwrap_or(Height::PRE_GENESIS))
    }

    async fn process_voteproof(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;
        if self.syncers().is_none() || self.exiting.load(Ordering::SeqCst) {
            return Ok(());
        }

        match voteproof.stage {
            Stage::Init => self.handle_init(voteproof).await,
            Stage::Accept => self.handle_accept(voteproof).await,
            _ => Ok(()),
        }
    }

    async fn handle_init(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        let local = self.local_height().await?;
        let to = voteproof.height.prev();

        if local > to {
            debug!(voteproof = %voteproof.stage_point(), local = %local, "voteproof has lower height");
            return Ok(());
        }
        if local < to {
            return self.sync_from(voteproof, to).await;
        }

        let finished = self.syncers().map(|s| s.is_finished()).unwrap_or(false);
        if !finished {
            debug!(voteproof = %voteproof.stage_point(), "expected init voteproof received, but not finished");
            return Ok(());
        }

        if !self.can_move_consensus() {
            debug!(voteproof = %voteproof.stage_point(), "expected init voteproof received, but stays in syncing");
            return Ok(());
        }

        debug!(voteproof = %voteproof.stage_point(), "init voteproof, expected; moves to consensus");
        self.ctx.set_last_voteproof(voteproof);
        self.stop_wait_voteproof()?;
        self.exiting.store(true, Ordering::SeqCst);
        Err(ConsensusError::switch(
            StateSwitchContext::new(NodeState::Syncing, NodeState::Consensus).with_voteproof(voteproof.clone()),
        ))
    }

    async fn handle_accept(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        let local = self.local_height().await?;
        if local >= voteproof.height {
            debug!(voteproof = %voteproof.stage_point(), local = %local, "voteproof has lower height");
            return Ok(());
        }
        self.sync_from(voteproof, voteproof.height).await
    }

    /// Extend the target with the voters of `voteproof` as sources
    async fn sync_from(&self, voteproof: &Voteproof, to: Height) -> ConsensusResult<()> {
        let mut sources: Vec<SyncSource> = Vec::new();
        for address in voteproof.voters_except(self.ctx.local.address()) {
            if !self.ctx.nodepool.exists(&address) {
                return Err(ConsensusError::invalid(format!(
                    "node, {} in voteproof is not known node",
                    address
                )));
            }
            match self.ctx.nodepool.channel(&address) {
                Some(ch) => sources.push((address, ch)),
                None => trace!(node = %address, "voter without channel; skipped as source"),
            }
        }

        debug!(voteproof = %voteproof.stage_point(), to = %to, sources = sources.len(), "will sync to the height");
        self.add(to, sources).await
    }

    async fn when_new_height(&self, height: Height) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;
        if self.syncers().is_none() || self.exiting.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(lvp) = self.ctx.last_voteproof() {
            if height <= lvp.height {
                return Ok(());
            }
        }
        if height <= self.local_height().await? {
            return Ok(());
        }

        let sources = self.ctx.nodepool.remote_channels();
        if sources.is_empty() {
            return Ok(());
        }
        self.add(height, sources).await
    }

    async fn add(&self, to: Height, sources: Vec<SyncSource>) -> ConsensusResult<()> {
        let syncers = match self.syncers() {
            Some(s) => s,
            None => return Ok(()),
        };

        match syncers.add(to, sources).await {
            Ok(_) => self.stop_wait_voteproof(),
            Err(e) if e.is_ignore() => {
                trace!(to = %to, error = %e, "sync target not added");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Highest last block the peers of the same network report
    async fn highest_remote_height(&self) -> Option<Height> {
        let channels = self.ctx.nodepool.remote_channels();
        let infos = join_all(channels.iter().map(|(_, ch)| ch.node_info())).await;

        infos
            .into_iter()
            .filter_map(|r| r.ok())
            .filter(|info| info.network_id == self.ctx.policy.network_id)
            .map(|info| info.last_height())
            .max()
    }

    fn can_move_consensus(&self) -> bool {
        if !self.ctx.is_local_in_suffrage() {
            debug!("local is not in suffrage; stays in syncing");
            return false;
        }
        if self.ctx.under_handover() && !self.ctx.handover_ready() {
            debug!("under handover, but not ready; stays in syncing");
            return false;
        }
        true
    }

    /// Falls back to joining when no voteproof shows up after syncing
    fn wait_voteproof(self: &Arc<Self>) -> ConsensusResult<()> {
        if self.ctx.timers.is_timer_started(TIMER_SYNCING_WAIT_VOTEPROOF) {
            return Ok(());
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let first = self.ctx.policy.wait_voteproof_after_sync();
        let timer = ContextTimer::new(TIMER_SYNCING_WAIT_VOTEPROOF, WAIT_VOTEPROOF_INTERVAL, move |_| {
            let weak = weak.clone();
            async move {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return Ok(false),
                };
                if !inner.can_move_consensus() {
                    return Ok(true);
                }
                if let Some(syncers) = inner.syncers() {
                    if !syncers.is_finished() {
                        debug!("syncers still running; keeps waiting");
                        return Ok(true);
                    }
                }

                debug!("syncing finished, but no more voteproof; moves to joining");
                if let Err(e) = inner
                    .ctx
                    .switch_state(StateSwitchContext::new(NodeState::Syncing, NodeState::Joining))
                {
                    error!(error = %e, "failed to switch state");
                }
                Ok(false)
            }
        })
        .with_interval(move |i| if i < 1 { first } else { WAIT_VOTEPROOF_INTERVAL });

        self.ctx.timers.set_timer(timer)?;
        self.ctx.timers.start_timers(&[TIMER_SYNCING_WAIT_VOTEPROOF], false)
    }

    fn stop_wait_voteproof(&self) -> ConsensusResult<()> {
        self.ctx.timers.stop_timers(&[TIMER_SYNCING_WAIT_VOTEPROOF])
    }
}

#[async_trait]
impl State for SyncingState {
    fn state(&self) -> NodeState {
        NodeState::Syncing
    }

    async fn enter(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        if self.inner.syncers().is_some() {
            return Err(ConsensusError::invalid("not stopped correctly; syncers still running"));
        }
        self.inner.exiting.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn entered(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        self.start_syncers().await?;
        self.start_node_info_checker();

        match sctx.voteproof() {
            Some(vp) => {
                debug!(voteproof = %vp.id(), "syncing started with voteproof");
                self.inner.process_voteproof(vp).await
            }
            None => {
                debug!("syncing started without voteproof");
                Ok(())
            }
        }
    }

    async fn exit(&self, _sctx: &StateSwitchContext) -> ConsensusResult<()> {
        self.inner.exiting.store(true, Ordering::SeqCst);
        self.inner.stop_wait_voteproof()?;

        if let Some(handle) = self.checker.lock().take() {
            handle.abort();
        }

        let syncers = self.inner.syncers.write().take();
        if let Some(syncers) = syncers {
            syncers.stop().await?;
        }
        Ok(())
    }

    async fn process_voteproof(&self, voteproof: &Voteproof) -> ConsensusResult<()> {
        self.inner.process_voteproof(voteproof).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::ballot::tests::ChainDatabase;
    use super::super::context::tests::{context_with, IdleProcessors};
    use super::super::context::ContextQueues;
    use super::*;
    use crate::database::Manifest;
    use crate::network::tests::RecordingChannel;
    use crate::syncer::{BlockSavedHook, FinishedHook, SyncersFactory};
    use crate::test_utils::*;
    use agora_core::Round;
    use agora_crypto::Hash;

    /// Syncers recording targets; finishing is driven by the test
    #[derive(Default)]
    struct RecordingSyncers {
        targets: Mutex<Vec<(Height, usize)>>,
        finished: AtomicBool,
        saved: Mutex<Option<BlockSavedHook>>,
        on_finished: Mutex<Option<FinishedHook>>,
        stopped: AtomicBool,
    }

    impl RecordingSyncers {
        fn finish(&self, height: Height) {
            self.finished.store(true, Ordering::SeqCst);
            let hook = self.on_finished.lock().clone();
            if let Some(hook) = hook {
                hook(height);
            }
        }
    }

    #[async_trait]
    impl Syncers for RecordingSyncers {
        async fn add(&self, to: Height, sources: Vec<SyncSource>) -> ConsensusResult<bool> {
            let mut targets = self.targets.lock();
            if targets.last().map(|(h, _)| *h >= to).unwrap_or(false) {
                return Err(ConsensusError::ignore("lower target"));
            }
            targets.push((to, sources.len()));
            Ok(self.finished.swap(false, Ordering::SeqCst))
        }
        fn is_finished(&self) -> bool {
            self.finished.load(Ordering::SeqCst)
        }
        fn set_when_block_saved(&self, hook: BlockSavedHook) {
            *self.saved.lock() = Some(hook);
        }
        fn set_when_finished(&self, hook: FinishedHook) {
            *self.on_finished.lock() = Some(hook);
        }
        async fn stop(&self) -> ConsensusResult<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Factory(Arc<RecordingSyncers>);

    impl SyncersFactory for Factory {
        fn new_syncers(&self, _: Option<Manifest>) -> ConsensusResult<Arc<dyn Syncers>> {
            Ok(self.0.clone())
        }
    }

    fn syncing(
        nodes: &[crate::local::LocalNode],
        db: Arc<ChainDatabase>,
    ) -> (SyncingState, Arc<RecordingSyncers>, ContextQueues) {
        let syncers = Arc::new(RecordingSyncers::default());
        let (ctx, queues) = context_with(nodes, 0, db, Arc::new(IdleProcessors), Arc::new(Factory(syncers.clone())));
        for n in &nodes[1..] {
            let ch = RecordingChannel::new(&format!("ch-{}", n.address()));
            ctx.nodepool.set_channel(n.address(), Some(ch)).unwrap();
        }
        (SyncingState::new(ctx), syncers, queues)
    }

    #[tokio::test]
    async fn test_voteproof_ahead_extends_target() {
        let nodes = test_nodes(3);
        let db = Arc::new(ChainDatabase::default().with_block(Height(3), Hash::digest(b"b3")));
        let (st, syncers, _queues) = syncing(&nodes, db);

        let ivp = init_voteproof(&nodes, Height(9), Round(0), &[0, 1, 2]);
        let sctx = StateSwitchContext::new(NodeState::Consensus, NodeState::Syncing).with_voteproof(ivp);
        st.enter(&sctx).await.unwrap();
        st.entered(&sctx).await.unwrap();

        // local is no source
        assert_eq!(*syncers.targets.lock(), vec![(Height(8), 2)]);

        let avp = accept_voteproof(&nodes, Height(10), Round(0), &[1, 2]);
        st.process_voteproof(&avp).await.unwrap();
        assert_eq!(syncers.targets.lock().last(), Some(&(Height(10), 2)));
    }

    #[tokio::test]
    async fn test_caught_up_init_moves_to_consensus() {
        let nodes = test_nodes(3);
        let db = Arc::new(ChainDatabase::default().with_block(Height(8), Hash::digest(b"b8")));
        let (st, syncers, _queues) = syncing(&nodes, db);

        let sctx = StateSwitchContext::new(NodeState::Booting, NodeState::Syncing);
        st.enter(&sctx).await.unwrap();
        st.entered(&sctx).await.unwrap();

        let ivp = init_voteproof(&nodes, Height(9), Round(0), &[0, 1, 2]);
        // not finished yet
        st.process_voteproof(&ivp).await.unwrap();

        syncers.finished.store(true, Ordering::SeqCst);
        let to = st.process_voteproof(&ivp).await.unwrap_err().into_switch_context().unwrap();
        assert_eq!(to.to(), NodeState::Consensus);
        assert_eq!(to.voteproof().map(|vp| vp.height), Some(Height(9)));

        st.exit(&to).await.unwrap();
        assert!(syncers.stopped.load(Ordering::SeqCst));
        assert!(st.inner.syncers().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_voteproof_after_finish_moves_to_joining() {
        let nodes = test_nodes(3);
        let avp = accept_voteproof(&nodes, Height(5), Round(0), &[0, 1, 2]);
        let db = Arc::new(
            ChainDatabase::default()
                .with_block(Height(5), Hash::digest(b"b5"))
                .with_voteproof(avp),
        );
        let (st, syncers, mut queues) = syncing(&nodes, db);

        let sctx = StateSwitchContext::new(NodeState::Booting, NodeState::Syncing);
        st.enter(&sctx).await.unwrap();
        st.entered(&sctx).await.unwrap();

        syncers.finish(Height(5));
        let to = tokio::time::timeout(Duration::from_secs(30), queues.switch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(to.to(), NodeState::Joining);
        assert_eq!(st.inner.ctx.last_voteproof().map(|vp| vp.height), Some(Height(5)));
    }

    #[tokio::test]
    async fn test_unknown_voter_is_invalid() {
        let nodes = test_nodes(4);
        let db = Arc::new(ChainDatabase::default());
        // only the first three are known to the nodepool
        let (st, _syncers, _queues) = syncing(&nodes[..3], db);

        let sctx = StateSwitchContext::new(NodeState::Booting, NodeState::Syncing);
        st.enter(&sctx).await.unwrap();
        st.entered(&sctx).await.unwrap();

        let avp = accept_voteproof(&nodes, Height(2), Round(0), &[1, 3]);
        assert!(st.process_voteproof(&avp).await.is_err());
    }

    #[tokio::test]
    async fn test_enter_twice_without_exit_fails() {
        let nodes = test_nodes(3);
        let (st, _syncers, _queues) = syncing(&nodes, Arc::new(ChainDatabase::default()));

        let sctx = StateSwitchContext::new(NodeState::Booting, NodeState::Syncing);
        st.enter(&sctx).await.unwrap();
        st.entered(&sctx).await.unwrap();
        assert!(st.enter(&sctx).await.is_err());
    }
}
