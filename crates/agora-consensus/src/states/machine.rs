//! # State Machine
//!
//! Owns the states and the single task that drives them. Everything that
//! changes the state goes through the queues of the [`StatesContext`]:
//!
//! ```text
//!   switch queue ────┐
//!   voteproof queue ─┼─► watcher ─► current state ─► SwitchState error
//!   proposal queue ──┘                                     │
//!                          ▲                               ▼
//!                          └──────────── exit ─► enter ─► entered
//! ```
//!
//! A switch that fails for any other reason sends the node back to
//! booting; failing to boot stops the machine.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use agora_core::{AgoraError, Height, NodeState, SharedClock, Stage, SystemClock};

use crate::ballot::{Proposal, Seal};
use crate::ballotbox::Ballotbox;
use crate::checker::{ProposalChecker, StuckDetector, StuckTransition, VoteproofChecker};
use crate::database::Database;
use crate::error::{ConsensusError, ConsensusResult};
use crate::handover::Handover;
use crate::local::LocalNode;
use crate::network::{Discovery, Nodepool, PassthroughFilter};
use crate::policy::LocalPolicy;
use crate::processor::ProcessorPool;
use crate::suffrage::Suffrage;
use crate::syncer::SyncersFactory;
use crate::voteproof::{compare_voteproof, Voteproof};

use super::ballot::{OperationsSource, ProposalMaker};
use super::booting::BootingState;
use super::consensus::ConsensusState;
use super::context::{ContextParts, ContextQueues, StatesContext};
use super::handover::HandoverState;
use super::joining::JoiningState;
use super::stopped::StoppedState;
use super::syncing::SyncingState;
use super::{State, StateEvent, StateSwitchContext, StatesConfig};

/// Ballots this many heights below the last voteproof are dropped
const BALLOTBOX_KEEP_HEIGHTS: i64 = 3;

pub struct StateMachineBuilder {
    local: LocalNode,
    policy: LocalPolicy,
    suffrage: Arc<dyn Suffrage>,
    database: Arc<dyn Database>,
    nodepool: Arc<Nodepool>,
    processors: Arc<dyn ProcessorPool>,
    syncers: Arc<dyn SyncersFactory>,
    discovery: Option<Arc<dyn Discovery>>,
    handover: Option<Arc<Handover>>,
    clock: SharedClock,
    operations: Option<OperationsSource>,
    config: StatesConfig,
}

impl StateMachineBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalNode,
        policy: LocalPolicy,
        suffrage: Arc<dyn Suffrage>,
        database: Arc<dyn Database>,
        nodepool: Arc<Nodepool>,
        processors: Arc<dyn ProcessorPool>,
        syncers: Arc<dyn SyncersFactory>,
    ) -> Self {
        Self {
            local,
            policy,
            suffrage,
            database,
            nodepool,
            processors,
            syncers,
            discovery: None,
            handover: None,
            clock: Arc::new(SystemClock),
            operations: None,
            config: StatesConfig::default(),
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_handover(mut self, handover: Arc<Handover>) -> Self {
        self.handover = Some(handover);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Source of the operations a local proposal carries
    pub fn with_operations(mut self, operations: OperationsSource) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn with_config(mut self, config: StatesConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ConsensusResult<Arc<StateMachine>> {
        self.policy.validate()?;

        let ballotbox = Arc::new(Ballotbox::new(
            self.suffrage.clone(),
            self.policy.threshold_ratio(),
            self.clock.clone(),
        ));
        let proposal_maker = Arc::new(match self.operations {
            Some(ops) => ProposalMaker::new(self.local.clone(), &self.policy, ops, self.clock.clone()),
            None => ProposalMaker::empty(self.local.clone(), &self.policy, self.clock.clone()),
        });

        let parts = ContextParts {
            local: self.local,
            policy: self.policy,
            suffrage: self.suffrage,
            database: self.database,
            nodepool: self.nodepool,
            ballotbox,
            processors: self.processors,
            syncers: self.syncers,
            discovery: self.discovery,
            handover: self.handover,
            clock: self.clock,
            proposal_maker,
        };
        let (ctx, queues) = StatesContext::new(parts, self.config.channel_capacity, self.config.events_capacity);

        let mut states: HashMap<NodeState, Arc<dyn State>> = HashMap::new();
        states.insert(NodeState::Stopped, Arc::new(StoppedState::new(ctx.clone())));
        states.insert(NodeState::Booting, Arc::new(BootingState::new(ctx.clone())));
        states.insert(NodeState::Joining, Arc::new(JoiningState::new(ctx.clone())));
        states.insert(NodeState::Consensus, Arc::new(ConsensusState::new(ctx.clone())));
        states.insert(NodeState::Syncing, Arc::new(SyncingState::new(ctx.clone())));
        states.insert(NodeState::Handover, Arc::new(HandoverState::new(ctx.clone())));

        Ok(Arc::new(StateMachine {
            ctx,
            config: self.config,
            states,
            lock: tokio::sync::Mutex::new(()),
            queues: Mutex::new(Some(queues)),
            shutdown_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }))
    }
}

/// Node state machine
pub struct StateMachine {
    ctx: Arc<StatesContext>,
    config: StatesConfig,
    states: HashMap<NodeState, Arc<dyn State>>,
    /// Serializes voteproof and proposal processing with stopping
    lock: tokio::sync::Mutex<()>,
    queues: Mutex<Option<ContextQueues>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl StateMachine {
    pub fn context(&self) -> &Arc<StatesContext> {
        &self.ctx
    }

    pub fn state(&self) -> NodeState {
        self.ctx.state()
    }

    pub fn last_voteproof(&self) -> Option<Voteproof> {
        self.ctx.last_voteproof()
    }

    pub fn last_init_voteproof(&self) -> Option<Voteproof> {
        self.ctx.last_init_voteproof()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.ctx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }

    /// Incoming seal from a peer or from the local node
    pub async fn new_seal(&self, seal: &Seal) -> ConsensusResult<()> {
        self.ctx.new_seal(seal).await
    }

    /// Start the background tasks and boot
    pub async fn start(self: &Arc<Self>) -> ConsensusResult<()> {
        let queues = self
            .queues
            .lock()
            .take()
            .ok_or_else(|| ConsensusError::invalid("state machine already started"))?;

        let lvp = self.ctx.database.last_voteproof(Stage::Accept).await?;
        let livp = self.ctx.database.last_voteproof(Stage::Init).await?;
        self.ctx.reset_last_voteproofs(lvp, livp);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let mut handles = vec![self.clean_ballotbox()];

        self.join().await;

        if self.ctx.is_local_in_suffrage() {
            handles.push(self.detect_stuck());
        }

        let machine = self.clone();
        handles.push(tokio::spawn(async move { machine.watch(queues, shutdown_rx).await }));
        self.handles.lock().extend(handles);

        info!(
            node = %self.ctx.local.address(),
            in_suffrage = self.ctx.is_local_in_suffrage(),
            "state machine started"
        );

        self.ctx
            .switch_state(StateSwitchContext::new(NodeState::Stopped, NodeState::Booting))
    }

    pub async fn stop(&self) -> ConsensusResult<()> {
        let shutdown_tx = self.shutdown_tx.lock().take();
        let shutdown_tx = shutdown_tx.ok_or(AgoraError::DaemonAlreadyStopped)?;
        // the watcher may have already exited on a fatal error
        let _ = shutdown_tx.send(()).await;

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }

        let _lock = self.lock.lock().await;
        let state = self.state();
        if state != NodeState::Stopped {
            if let Some(st) = self.states.get(&state) {
                if let Err(e) = st.exit(&StateSwitchContext::new(state, NodeState::Stopped)).await {
                    if e.into_switch_context().is_err() {
                        error!(state = %state, "failed to exit state while stopping");
                    }
                }
            }
        }
        self.ctx.timers.stop_all();
        self.set_state(NodeState::Stopped);

        info!("state machine stopped");
        Ok(())
    }

    /// The operator approves the handover of this new node
    pub async fn start_handover(&self) -> ConsensusResult<()> {
        let result = self.try_start_handover().await;
        match &result {
            Ok(()) => info!("handover started"),
            Err(e) if e.is_handover_rejected() => debug!(error = %e, "trying to start handover; but rejected"),
            Err(e) => error!(error = %e, "trying to start handover; but failed"),
        }
        result
    }

    async fn try_start_handover(&self) -> ConsensusResult<()> {
        let hd = self
            .ctx
            .handover
            .clone()
            .ok_or_else(|| ConsensusError::handover_rejected("handover not supported"))?;

        match self.state() {
            NodeState::Stopped => return Err(ConsensusError::handover_rejected("node is stopped")),
            NodeState::Handover => return Err(ConsensusError::handover_rejected("node is already in handover")),
            NodeState::Consensus => return Err(ConsensusError::handover_rejected("node is already in consensus")),
            _ => {}
        }

        hd.refresh(Vec::new()).await?;

        if !hd.under_handover() {
            return Err(ConsensusError::handover_rejected("not under handover"));
        }
        if hd.is_ready() {
            return Err(ConsensusError::handover_rejected("handover was already ready"));
        }
        hd.set_ready(true);
        Ok(())
    }

    /// The new node of `conn_info` takes over; this node stops voting and
    /// falls back to syncing
    pub async fn end_handover(&self, conn_info: &str) -> ConsensusResult<()> {
        let result = self.try_end_handover(conn_info).await;
        match &result {
            Ok(()) => info!(conn_info, "handover ended"),
            Err(e) if e.is_handover_rejected() => debug!(conn_info, error = %e, "trying to end handover; but rejected"),
            Err(e) => error!(conn_info, error = %e, "trying to end handover; but failed"),
        }
        result
    }

    async fn try_end_handover(&self, conn_info: &str) -> ConsensusResult<()> {
        let hd = self
            .ctx
            .handover
            .clone()
            .ok_or_else(|| ConsensusError::handover_rejected("handover not supported"))?;

        let ch = hd.load_channel(conn_info).await?;
        hd.refresh(vec![ch]).await?;

        if !hd.under_handover() {
            return Err(ConsensusError::handover_rejected(
                "handover refreshed, but not under handover",
            ));
        }
        debug!(conn_info, "handover refreshed and under handover");

        self.ctx.timers.stop_all();

        // no more ballots to the new node
        if let Some(new_node) = hd.old_node() {
            let filter: PassthroughFilter = Arc::new(|seal: &Seal| seal.as_ballot().is_none());
            self.ctx.nodepool.set_passthrough(new_node, Some(filter))?;
        }

        self.ctx.leave_discovery().await?;

        self.ctx.switch_state(
            StateSwitchContext::new(NodeState::Unknown, NodeState::Syncing).allow_empty(true),
        )
    }

    fn set_state(&self, state: NodeState) {
        let from = self.ctx.state();
        self.ctx.set_state(state);
        if from != state {
            self.ctx.emit(StateEvent::StateChanged { from, to: state });
        }
    }

    async fn join(&self) {
        if !self.ctx.is_local_in_suffrage() {
            return;
        }

        if let Some(hd) = &self.ctx.handover {
            if let Err(e) = hd.start().await {
                error!(error = %e, "failed to start handover");
            }
            if hd.under_handover() {
                debug!("duplicated node found; under handover; joins later");
                return;
            }
        }

        if let Err(e) = self.ctx.join_discovery().await {
            error!(error = %e, "failed to join discovery");
        }
    }

    async fn watch(self: Arc<Self>, mut queues: ContextQueues, mut shutdown_rx: mpsc::Receiver<()>) {
        loop {
            let result = tokio::select! {
                _ = shutdown_rx.recv() => break,
                Some(sctx) = queues.switch.recv() => Err(ConsensusError::switch(sctx)),
                Some(vp) = queues.voteproof.recv() => self.process_voteproof(vp).await,
                Some(proposal) = queues.proposal.recv() => self.process_proposal(proposal).await,
                else => break,
            };

            let sctx = match result {
                Ok(()) => continue,
                Err(e) if e.is_ignore() => {
                    trace!(error = %e, "ignored");
                    continue;
                }
                Err(e) => match e.into_switch_context() {
                    Ok(sctx) => sctx,
                    Err(e) => {
                        error!(error = %e, "something wrong");
                        continue;
                    }
                },
            };

            if let Err(e) = self.process_switch_states(sctx).await {
                error!(error = %e, "failed to switch state; state machine stops");
                self.ctx.timers.stop_all();
                self.set_state(NodeState::Stopped);
                break;
            }
            if self.state() == NodeState::Stopped {
                debug!("stopped by state switch");
                break;
            }
        }
    }

    /// Follow switch requests until one settles; unexpected errors go
    /// through booting again
    async fn process_switch_states(&self, mut sctx: StateSwitchContext) -> ConsensusResult<()> {
        loop {
            let err = match self.switch_state(sctx.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match err.into_switch_context() {
                Ok(next) => sctx = next,
                Err(e) if e.is_ignore() => {
                    debug!(error = %e, "problem during state switch, but ignored");
                    return Ok(());
                }
                Err(e) => {
                    error!(sctx = %sctx, error = %e, "problem during state switch; moves to booting");
                    if sctx.to() == NodeState::Booting {
                        return Err(e);
                    }
                    tokio::time::sleep(self.config.booting_retry_delay).await;
                    sctx = StateSwitchContext::new(self.state(), NodeState::Booting).with_error(e);
                }
            }
        }
    }

    async fn switch_state(&self, sctx: StateSwitchContext) -> ConsensusResult<()> {
        let current = self.state();
        debug!(sctx = %sctx, current = %current, "switching state");

        sctx.is_valid()?;

        let sctx = if sctx.from() == NodeState::Unknown {
            sctx.with_from(current)
        } else {
            sctx
        };

        if sctx.from() != current {
            debug!(sctx = %sctx, current = %current, "current state does not match; ignored");
            return Ok(());
        }

        let sctx = self.switch_handover(sctx)?;

        if sctx.to() == current {
            if let Some(vp) = sctx.voteproof() {
                debug!(voteproof = %vp.id(), "processing voteproof into current state");
                if let Err(e) = self.process_voteproof_internal(vp.clone()).await {
                    debug!(error = %e, "failed to process voteproof into current state; ignored");
                }
            }
            return Ok(());
        }

        self.exit_state(&sctx).await?;
        self.enter_state(&sctx).await
    }

    async fn exit_state(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        let st = self.state_of(sctx.from())?;
        match st.exit(sctx).await {
            Ok(()) => {
                debug!(state = %sctx.from(), "state exited");
                Ok(())
            }
            Err(e) => match e.into_switch_context() {
                Ok(next) if next.to() != sctx.from() => Err(ConsensusError::switch(next)),
                Ok(_) => {
                    debug!("exit returned the same from state; ignored");
                    Ok(())
                }
                Err(e) => {
                    error!(state = %sctx.from(), error = %e, "something wrong on exit");
                    Ok(())
                }
            },
        }
    }

    async fn enter_state(&self, sctx: &StateSwitchContext) -> ConsensusResult<()> {
        let st = self.state_of(sctx.to())?;
        if let Err(e) = st.enter(sctx).await {
            return match e.into_switch_context() {
                Ok(next) if next.to() == sctx.to() => {
                    error!(sctx = %sctx, "enter returned the same to state; ignored");
                    Ok(())
                }
                Ok(next) => Err(ConsensusError::switch(next)),
                Err(e) => Err(e),
            };
        }

        self.set_state(sctx.to());
        info!(from = %sctx.from(), to = %sctx.to(), "state switched");

        match st.entered(sctx).await {
            Ok(()) => Ok(()),
            Err(e) => match e.into_switch_context() {
                Ok(next) => Err(ConsensusError::switch(next)),
                // a node which can not boot has nowhere else to go
                Err(e) if sctx.to() == NodeState::Booting => Err(e),
                Err(e) => {
                    error!(state = %sctx.to(), error = %e, "something wrong after entering");
                    Ok(())
                }
            },
        }
    }

    fn state_of(&self, state: NodeState) -> ConsensusResult<&Arc<dyn State>> {
        self.states
            .get(&state)
            .ok_or_else(|| ConsensusError::invalid(format!("unknown state, {}", state)))
    }

    /// Redirects switches while a handover is going on
    fn switch_handover(&self, sctx: StateSwitchContext) -> ConsensusResult<StateSwitchContext> {
        if sctx.from() == NodeState::Handover || sctx.from() == sctx.to() || sctx.to() == NodeState::Booting {
            return Ok(sctx);
        }

        if !self.ctx.under_handover() {
            if sctx.to() == NodeState::Handover {
                return Err(ConsensusError::ignore("not under handover; handover state ignored"));
            }
            return Ok(sctx);
        }

        if !self.ctx.handover_ready() {
            debug!(sctx = %sctx, "handover not yet ready; moves to syncing");
            return Ok(sctx.with_to(NodeState::Syncing));
        }

        if sctx.to() == NodeState::Consensus {
            debug!(sctx = %sctx, "under handover; consensus -> handover");
            return Ok(sctx.with_to(NodeState::Handover));
        }
        Ok(sctx)
    }

    async fn process_voteproof(&self, voteproof: Voteproof) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;

        if compare_voteproof(Some(&voteproof), self.ctx.last_voteproof().as_ref()) != Ordering::Greater {
            debug!(voteproof = %voteproof.id(), "old or same voteproof received");
            return Ok(());
        }
        self.process_voteproof_internal(voteproof).await
    }

    async fn process_voteproof_internal(&self, voteproof: Voteproof) -> ConsensusResult<()> {
        debug!(voteproof = %voteproof.id(), "new voteproof");

        let state = self.state();
        let last = self.ctx.last_voteproof();
        let checked = VoteproofChecker::new(
            self.ctx.database.as_ref(),
            &self.ctx.nodepool,
            self.ctx.suffrage.as_ref(),
            &self.ctx.policy.network_id,
            self.ctx.policy.threshold_ratio(),
            last.as_ref(),
            &voteproof,
        )
        .check()
        .await;

        let mut pending: Option<StateSwitchContext> = None;
        match checked {
            Ok(()) => {}
            Err(e) if e.is_sync_by_voteproof() => {
                if state != NodeState::Syncing {
                    pending = Some(
                        StateSwitchContext::new(state, NodeState::Syncing)
                            .with_voteproof(voteproof.clone())
                            .with_error(e),
                    );
                }
            }
            Err(e) if e.is_ignore() => {
                debug!(voteproof = %voteproof.id(), error = %e, "voteproof ignored");
                return Ok(());
            }
            Err(e) => match e.into_switch_context() {
                Ok(sctx) => pending = Some(sctx),
                Err(e) => return Err(e),
            },
        }

        if matches!(state, NodeState::Joining | NodeState::Consensus | NodeState::Handover)
            && !self.ctx.set_last_voteproof(&voteproof)
        {
            return Err(ConsensusError::ignore("old voteproof received"));
        }

        match pending {
            Some(sctx) if sctx.to() != state => Err(ConsensusError::switch(sctx)),
            _ => self.state_of(state)?.process_voteproof(&voteproof).await,
        }
    }

    async fn process_proposal(&self, proposal: Proposal) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;

        let livp = self.ctx.last_init_voteproof();
        let checker = ProposalChecker::new(
            self.ctx.database.as_ref(),
            &self.ctx.nodepool,
            self.ctx.suffrage.as_ref(),
            &self.ctx.policy.network_id,
            &proposal,
            livp.as_ref(),
        );
        if let Err(e) = checker.check_dispatch() {
            error!(proposal = %proposal.hash(), error = %e, "proposal validation failed");
            return Err(ConsensusError::ignore(e));
        }

        self.state_of(self.state())?.process_proposal(&proposal).await
    }

    fn clean_ballotbox(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let interval = self.config.clean_ballotbox_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let height = match ctx.last_voteproof() {
                    Some(vp) => vp.height.0 - BALLOTBOX_KEEP_HEIGHTS,
                    None => continue,
                };
                if height < 0 {
                    continue;
                }
                let removed = ctx.ballotbox.clean(Height(height));
                trace!(height, removed, "ballotbox cleaned");
            }
        })
    }

    fn detect_stuck(&self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let interval = self.config.stuck_check_interval;
        let detector = StuckDetector::new(self.config.stuck_endure);
        debug!("detecting whether consensus is stuck");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let last = ctx.last_voteproof();
                match detector.check(ctx.state(), last.as_ref(), ctx.clock.now()) {
                    StuckTransition::Stuck => ctx.emit(StateEvent::ConsensusStuck),
                    StuckTransition::Released => ctx.emit(StateEvent::ConsensusReleased),
                    StuckTransition::Unchanged => {}
                }
            }
        })
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("ctx", &self.ctx)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::ballot::tests::ChainDatabase;
    use super::super::consensus::tests::HashingProcessors;
    use super::super::context::tests::NoSyncers;
    use super::*;
    use crate::test_utils::*;
    use agora_core::Round;
    use agora_crypto::Hash;
    use std::time::Duration;

    fn machine(nodes: &[LocalNode], db: Arc<ChainDatabase>) -> Arc<StateMachine> {
        let policy = LocalPolicy {
            threshold_ratio: TEST_RATIO,
            ..LocalPolicy::default()
        }
        .with_network_id(network());

        let nodepool = Arc::new(Nodepool::new(nodes[0].clone()));
        for n in &nodes[1..] {
            nodepool.add(n.address().clone(), *n.public_key(), None).unwrap();
        }

        StateMachineBuilder::new(
            nodes[0].clone(),
            policy,
            Arc::new(fixed_suffrage(nodes)),
            db,
            nodepool,
            Arc::new(HashingProcessors::default()),
            Arc::new(NoSyncers),
        )
        .build()
        .unwrap()
    }

    async fn next_event<F>(events: &mut broadcast::Receiver<StateEvent>, mut matches: F) -> StateEvent
    where
        F: FnMut(&StateEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
                .await
                .expect("event in time")
                .expect("event channel open");
            if matches(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_standalone_node_stores_blocks() {
        let nodes = test_nodes(1);
        let genesis = accept_voteproof(&nodes, Height::GENESIS, Round(0), &[0]);
        let db = Arc::new(
            ChainDatabase::default()
                .with_block(Height::GENESIS, Hash::digest(b"new-block"))
                .with_voteproof(genesis),
        );
        let m = machine(&nodes, db);
        let mut events = m.subscribe();

        m.start().await.unwrap();

        next_event(&mut events, |e| {
            matches!(e, StateEvent::StateChanged { to: NodeState::Consensus, .. })
        })
        .await;

        let blocks = match next_event(&mut events, |e| matches!(e, StateEvent::NewBlocks(_))).await {
            StateEvent::NewBlocks(blocks) => blocks,
            _ => unreachable!(),
        };
        assert_eq!(blocks[0].manifest.height, Height(1));
        assert_eq!(m.state(), NodeState::Consensus);

        m.stop().await.unwrap();
        assert_eq!(m.state(), NodeState::Stopped);
        assert!(m.stop().await.unwrap_err().is_daemon_already_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_without_blocks_or_peers_stops() {
        let nodes = test_nodes(3);
        let m = machine(&nodes, Arc::new(ChainDatabase::default()));
        let mut events = m.subscribe();

        m.start().await.unwrap();

        next_event(&mut events, |e| {
            matches!(e, StateEvent::StateChanged { to: NodeState::Booting, .. })
        })
        .await;
        next_event(&mut events, |e| {
            matches!(
                e,
                StateEvent::StateChanged {
                    from: NodeState::Booting,
                    to: NodeState::Stopped
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let nodes = test_nodes(1);
        let genesis = accept_voteproof(&nodes, Height::GENESIS, Round(0), &[0]);
        let db = Arc::new(
            ChainDatabase::default()
                .with_block(Height::GENESIS, Hash::digest(b"new-block"))
                .with_voteproof(genesis),
        );
        let m = machine(&nodes, db);

        m.start().await.unwrap();
        assert!(m.start().await.is_err());
        m.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handover_rejected_without_engine() {
        let nodes = test_nodes(3);
        let m = machine(&nodes, Arc::new(ChainDatabase::default()));

        assert!(m.start_handover().await.unwrap_err().is_handover_rejected());
        assert!(m.end_handover("local://n0").await.unwrap_err().is_handover_rejected());
    }

    #[test]
    fn test_handover_state_needs_handover() {
        let nodes = test_nodes(3);
        let m = machine(&nodes, Arc::new(ChainDatabase::default()));

        let to_handover = StateSwitchContext::new(NodeState::Joining, NodeState::Handover);
        assert!(m.switch_handover(to_handover).unwrap_err().is_ignore());

        let to_consensus = StateSwitchContext::new(NodeState::Joining, NodeState::Consensus);
        assert_eq!(m.switch_handover(to_consensus).unwrap().to(), NodeState::Consensus);
    }

    #[tokio::test]
    async fn test_old_voteproof_is_dropped() {
        let nodes = test_nodes(3);
        let m = machine(&nodes, Arc::new(ChainDatabase::default()));
        m.ctx.set_state(NodeState::Consensus);

        let last = init_voteproof(&nodes, Height(5), Round(1), &[0, 1, 2]);
        m.ctx.set_last_voteproof(&last);

        let older = init_voteproof(&nodes, Height(5), Round(0), &[0, 1, 2]);
        m.process_voteproof(older).await.unwrap();
        assert_eq!(m.last_voteproof().unwrap().round, Round(1));
    }

    #[tokio::test]
    async fn test_far_ahead_voteproof_switches_to_syncing() {
        let nodes = test_nodes(3);
        let m = machine(&nodes, Arc::new(ChainDatabase::default()));
        m.ctx.set_state(NodeState::Consensus);
        m.ctx.set_last_voteproof(&accept_voteproof(&nodes, Height(7), Round(0), &[0, 1, 2]));

        let ahead = init_voteproof(&nodes, Height(10), Round(0), &[0, 1, 2]);
        let sctx = m.process_voteproof(ahead).await.unwrap_err().into_switch_context().unwrap();
        assert_eq!(sctx.from(), NodeState::Consensus);
        assert_eq!(sctx.to(), NodeState::Syncing);
        assert!(sctx.error().map(ConsensusError::is_sync_by_voteproof).unwrap_or(false));
    }

    #[tokio::test]
    async fn test_voteproof_of_other_threshold_rejected() {
        let nodes = test_nodes(3);
        let m = machine(&nodes, Arc::new(ChainDatabase::default()));
        m.ctx.set_state(NodeState::Consensus);
        let last = accept_voteproof(&nodes, Height(7), Round(0), &[0, 1, 2]);
        m.ctx.set_last_voteproof(&last);

        // a majority of one over a total of one
        let mut lone = make_voteproof(&nodes[..1], &[0], |_| {
            crate::ballot::BallotFact::init(Height(8), Round(0), Hash::digest(b"new-block"))
        });
        lone.suffrages = nodes.iter().map(|n| n.address().clone()).collect();
        assert!(lone.is_valid(&network()).is_ok());

        let err = m.process_voteproof(lone).await.unwrap_err();
        assert!(matches!(err.core(), Some(agora_core::AgoraError::Invalid(_))));
        assert_eq!(m.last_voteproof().map(|vp| vp.stage_point()), Some(last.stage_point()));
    }
}
