//! # Handover engine
//!
//! Lets a new process take over the identity of a running validator
//! without both of them voting at once.
//!
//! ```text
//!   new node                                  old node
//!   ────────                                  ────────
//!   investigate ── NodeInfo ─────────────────► (same address)
//!   under handover, old node = ch
//!   ping loop ──── PingHandover ─────────────►
//!   keep-verify ── NodeInfo ─────────────────►  address still ours?
//!   start_handover (operator) ─ StartHandover►
//!   ... Handover state, joined INIT ...
//!   finish ─────── EndHandover ──────────────►  stops voting, syncs
//! ```
//!
//! The engine only tracks whether a handover is going on and keeps the
//! link to the old node alive; the state machine decides when to promote.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use agora_core::{AgoraError, SharedClock};

use crate::error::{ConsensusError, ConsensusResult};
use crate::local::LocalNode;
use crate::network::{Channel, ChannelLoader, ConnInfo, NodeInfo, Nodepool, RemoteNode};
use crate::policy::LocalPolicy;
use crate::suffrage::Suffrage;
use crate::timer::ContextTimer;

pub use crate::ballot::seal::{HandoverSeal, HandoverSealKind};

/// Tries of the duplicated node lookup before giving up
const MAX_INVESTIGATE_TRIES: usize = 3;

#[derive(Default)]
struct Flags {
    under_handover: bool,
    old_node: Option<Arc<dyn Channel>>,
    ready: bool,
}

/// Handover flags. While a reset is in progress every setter is a no-op,
/// so a late finding can not resurrect a stopped handover.
#[derive(Default)]
struct Status {
    flags: RwLock<Flags>,
    resetting: RwLock<bool>,
}

/// Releases the reset lock of [`Status`] when dropped
struct ResetGuard<'a>(&'a Status);

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        *self.0.resetting.write() = false;
    }
}

impl Status {
    fn is_resetting(&self) -> bool {
        *self.resetting.read()
    }

    fn under_handover(&self) -> bool {
        self.flags.read().under_handover
    }

    fn old_node(&self) -> Option<Arc<dyn Channel>> {
        self.flags.read().old_node.clone()
    }

    fn is_ready(&self) -> bool {
        self.flags.read().ready
    }

    fn set_under_handover(&self, b: bool) {
        if !self.is_resetting() {
            self.flags.write().under_handover = b;
        }
    }

    fn set_old_node(&self, ch: Option<Arc<dyn Channel>>) {
        if !self.is_resetting() {
            self.flags.write().old_node = ch;
        }
    }

    fn set_ready(&self, b: bool) {
        if !self.is_resetting() {
            self.flags.write().ready = b;
        }
    }

    fn reset(&self) -> ResetGuard<'_> {
        let mut resetting = self.resetting.write();
        *self.flags.write() = Flags::default();
        *resetting = true;
        ResetGuard(self)
    }
}

pub struct Handover {
    conn_info: ConnInfo,
    local: LocalNode,
    policy: LocalPolicy,
    nodepool: Arc<Nodepool>,
    suffrage: Arc<dyn Suffrage>,
    loader: Arc<dyn ChannelLoader>,
    clock: SharedClock,
    status: Status,
    remote_channels: Mutex<IndexMap<ConnInfo, Arc<dyn Channel>>>,
    ping: Mutex<Option<Arc<ContextTimer>>>,
    keep_verify: Mutex<Option<JoinHandle<()>>>,
    lock: tokio::sync::Mutex<()>,
}

impl Handover {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn_info: impl Into<ConnInfo>,
        local: LocalNode,
        policy: LocalPolicy,
        nodepool: Arc<Nodepool>,
        suffrage: Arc<dyn Suffrage>,
        loader: Arc<dyn ChannelLoader>,
        clock: SharedClock,
    ) -> Self {
        Self {
            conn_info: conn_info.into(),
            local,
            policy,
            nodepool,
            suffrage,
            loader,
            clock,
            status: Status::default(),
            remote_channels: Mutex::new(IndexMap::new()),
            ping: Mutex::new(None),
            keep_verify: Mutex::new(None),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Extra channels to look for the old node on, besides the nodepool
    pub fn with_remote_channels(self, channels: Vec<Arc<dyn Channel>>) -> Self {
        {
            let mut rchs = self.remote_channels.lock();
            for ch in channels {
                rchs.insert(ch.conn_info().to_string(), ch);
            }
        }
        self
    }

    pub fn conn_info(&self) -> &str {
        &self.conn_info
    }

    pub fn under_handover(&self) -> bool {
        self.status.under_handover()
    }

    /// Under handover and approved by the operator
    pub fn is_ready(&self) -> bool {
        self.status.under_handover() && self.status.is_ready()
    }

    pub fn set_ready(&self, ready: bool) {
        self.status.set_ready(ready);
        debug!(ready, "handover readiness changed");
    }

    pub fn old_node(&self) -> Option<Arc<dyn Channel>> {
        self.status.old_node()
    }

    pub fn is_running(&self) -> bool {
        self.keep_verify
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn seal(&self, kind: HandoverSealKind) -> HandoverSeal {
        HandoverSeal::new(kind, &self.local, self.conn_info.clone(), &self.policy.network_id, self.clock.now())
    }

    /// Channel to `conn_info`, reusing a known remote channel when there is one
    pub async fn load_channel(&self, conn_info: &str) -> ConsensusResult<Arc<dyn Channel>> {
        if let Some(ch) = self.remote_channels.lock().get(conn_info).cloned() {
            return Ok(ch);
        }
        let ch = self.loader.load(conn_info).await?;
        self.remote_channels.lock().insert(conn_info.to_string(), ch.clone());
        Ok(ch)
    }

    /// Look for the old node and, when found, keep watching it
    pub async fn start(self: &Arc<Self>) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;
        self.start_until_under_handover().await
    }

    /// Restart with additional channels to investigate
    pub async fn refresh(self: &Arc<Self>, channels: Vec<Arc<dyn Channel>>) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;

        let added = self.add_remote_channels(channels);
        if added {
            debug!("remote channels added to handover");
        }

        self.stop_loops();
        self.start_until_under_handover().await?;
        debug!(under_handover = self.under_handover(), "handover refreshed");
        Ok(())
    }

    pub async fn stop(&self) -> ConsensusResult<()> {
        let _lock = self.lock.lock().await;

        let _guard = self.status.reset();
        self.stop_loops();
        debug!("handover stopped");
        Ok(())
    }

    fn stop_loops(&self) {
        if let Some(timer) = self.ping.lock().take() {
            let _ = timer.stop();
        }
        if let Some(h) = self.keep_verify.lock().take() {
            h.abort();
        }
    }

    async fn start_until_under_handover(self: &Arc<Self>) -> ConsensusResult<()> {
        match self.investigate().await {
            Ok(true) => {}
            Ok(false) => {
                drop(self.status.reset());
                debug!("not under handover");
                return Ok(());
            }
            Err(e) => {
                drop(self.status.reset());
                if e.is_ignore() {
                    debug!(error = %e, "handover investigation skipped");
                } else {
                    error!(error = %e, "failed to investigate handover");
                }
                return Ok(());
            }
        }

        self.start_ping()?;
        self.start_keep_verify();
        debug!("under handover; watching old node");
        Ok(())
    }

    fn add_remote_channels(&self, channels: Vec<Arc<dyn Channel>>) -> bool {
        let known = self.remote_channel_list();
        let mut rchs = self.remote_channels.lock();

        let mut added = false;
        for ch in channels {
            let ci = ch.conn_info().to_string();
            if known.iter().any(|k| k.conn_info() == ci) {
                continue;
            }
            rchs.insert(ci, ch);
            added = true;
        }
        added
    }

    /// Live nodepool channels plus the extra channels, one per address
    fn remote_channel_list(&self) -> Vec<Arc<dyn Channel>> {
        let mut founds: IndexMap<String, Arc<dyn Channel>> = IndexMap::new();
        for (_, ch) in self.nodepool.remote_channels() {
            founds.entry(ch.conn_info().to_string()).or_insert(ch);
        }
        for (ci, ch) in self.remote_channels.lock().iter() {
            founds.entry(ci.clone()).or_insert_with(|| ch.clone());
        }
        founds.into_values().collect()
    }

    async fn investigate(&self) -> ConsensusResult<bool> {
        if !self.suffrage.is_inside(self.local.address()) {
            return Err(ConsensusError::ignore("local is not suffrage node"));
        }

        if self.remote_channel_list().is_empty() {
            debug!("no remote channels to investigate");
            return Ok(false);
        }

        let mut tried = 0;
        let found = loop {
            match self.check_duplicated_node().await {
                Ok(found) => break found,
                Err(e) if e.is_ignore() => break None,
                Err(e) => {
                    tried += 1;
                    if tried >= MAX_INVESTIGATE_TRIES {
                        return Err(e);
                    }
                    trace!(tried, error = %e, "retrying duplicated node lookup");
                }
            }
        };

        match found {
            Some((ch, ni)) => {
                self.when_found(ch, &ni).await?;
                Ok(true)
            }
            None => {
                debug!("duplicated node not found");
                Ok(false)
            }
        }
    }

    /// Ask every remote channel whether the local address already runs
    async fn check_duplicated_node(&self) -> ConsensusResult<Option<(Arc<dyn Channel>, NodeInfo)>> {
        let channels = self.remote_channel_list();
        let timeout = self.policy.network_connection_timeout();

        let lookups = channels.iter().map(|ch| async move {
            let ni = match tokio::time::timeout(timeout, ch.node_info()).await {
                Ok(Ok(ni)) => ni,
                Ok(Err(e)) => {
                    debug!(conn_info = ch.conn_info(), error = %e, "failed to get node info");
                    return None;
                }
                Err(_) => {
                    debug!(conn_info = ch.conn_info(), "node info timed out");
                    return None;
                }
            };
            if ni.network_id != self.policy.network_id {
                debug!(conn_info = ch.conn_info(), "node info from other network");
                return None;
            }
            self.duplicated_from_node_info(&ni).await.map(|dup| (dup, ni))
        });

        match join_all(lookups).await.into_iter().flatten().next() {
            Some(found) => {
                warn!(conn_info = found.0.conn_info(), "duplicated node found; same node is already running");
                Ok(Some(found))
            }
            None => Err(ConsensusError::ignore("failed to find duplicated node")),
        }
    }

    async fn duplicated_from_node_info(&self, ni: &NodeInfo) -> Option<Arc<dyn Channel>> {
        if ni.address == *self.local.address() {
            if ni.conn_info == self.conn_info {
                return None;
            }
            return self.loader.load(&ni.conn_info).await.ok();
        }

        // a peer knowing ourselves is not a duplicate
        let dup = ni.knows(self.local.address()).filter(|dup| dup.conn_info != self.conn_info)?;
        let ch = self.loader.load(&dup.conn_info).await.ok()?;
        debug!(conn_info = %dup.conn_info, "duplication suspected node found");
        ch.node_info().await.ok()?;
        Some(ch)
    }

    async fn when_found(&self, ch: Arc<dyn Channel>, ni: &NodeInfo) -> ConsensusResult<()> {
        self.update_nodes(&ni.nodes).await?;
        self.status.set_under_handover(true);

        let same = self
            .status
            .old_node()
            .map(|old| old.conn_info() == ch.conn_info())
            .unwrap_or(false);
        if !same {
            self.status.set_old_node(Some(ch));
        }
        Ok(())
    }

    /// Learn suffrage members the old node knows and we do not
    async fn update_nodes(&self, nodes: &[RemoteNode]) -> ConsensusResult<()> {
        let mut updated = Vec::new();
        for no in nodes {
            if !self.suffrage.is_inside(&no.address) || no.address == *self.local.address() || no.conn_info.is_empty() {
                continue;
            }

            if !self.nodepool.exists(&no.address) {
                let ch = self.loader.load(&no.conn_info).await?;
                self.nodepool.add(no.address.clone(), no.public_key, Some(ch))?;
                updated.push(no.address.clone());
                continue;
            }

            let stale = self
                .nodepool
                .channel(&no.address)
                .map(|ch| ch.conn_info() != no.conn_info)
                .unwrap_or(true);
            if stale {
                let ch = self.loader.load(&no.conn_info).await?;
                self.nodepool.set_channel(&no.address, Some(ch))?;
                updated.push(no.address.clone());
            }
        }

        if !updated.is_empty() {
            debug!(updated = ?updated, "nodes in nodepool updated");
        }
        Ok(())
    }

    fn start_ping(self: &Arc<Self>) -> ConsensusResult<()> {
        if self.status.old_node().is_none() {
            return Err(ConsensusError::invalid("old node is not set"));
        }

        let hd = Arc::downgrade(self);
        let timer = ContextTimer::new("ping-handover", self.policy.interval_ping_handover(), move |_| {
            let hd = hd.clone();
            async move {
                let hd = match hd.upgrade() {
                    Some(hd) => hd,
                    None => return Ok(false),
                };
                if !hd.under_handover() {
                    trace!("not under handover; ping passed");
                    return Ok(true);
                }
                let old = hd
                    .old_node()
                    .ok_or_else(|| ConsensusError::invalid("old node is not set"))?;

                let seal = hd.seal(HandoverSealKind::Ping);
                match old.ping_handover(&seal).await {
                    Ok(true) => {}
                    Ok(false) => error!(conn_info = old.conn_info(), "failed to ping; old node rejects"),
                    Err(e) => error!(conn_info = old.conn_info(), error = %e, "failed to ping"),
                }
                Ok(true)
            }
        });
        timer.start()?;
        *self.ping.lock() = Some(Arc::new(timer));
        Ok(())
    }

    fn start_keep_verify(self: &Arc<Self>) {
        let hd = Arc::downgrade(self);
        let interval = self.policy.interval_keep_verify_duplicated_node();
        let max = self.policy.max_failed_count_keep_verify_duplicated_node.max(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            let mut failed = 0u32;
            loop {
                ticker.tick().await;
                let hd = match hd.upgrade() {
                    Some(hd) => hd,
                    None => break,
                };
                let old = match hd.old_node() {
                    Some(old) => old,
                    None => break,
                };

                match old.node_info().await {
                    Ok(ni) if ni.address == *hd.local.address() => {
                        if hd.when_found(old, &ni).await.is_ok() {
                            failed = 0;
                            continue;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => trace!(error = %e, "failed to verify old node"),
                }

                failed += 1;
                if failed >= max {
                    drop(hd.status.reset());
                    if let Some(timer) = hd.ping.lock().take() {
                        let _ = timer.stop();
                    }
                    debug!("old node is not alive; not under handover");
                    break;
                }
            }
        });

        *self.keep_verify.lock() = Some(task);
    }
}

impl Drop for Handover {
    fn drop(&mut self) {
        if let Some(h) = self.keep_verify.get_mut().take() {
            h.abort();
        }
    }
}

impl fmt::Debug for Handover {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handover")
            .field("conn_info", &self.conn_info)
            .field("under_handover", &self.under_handover())
            .field("ready", &self.status.is_ready())
            .finish()
    }
}

/// Verify a handover seal came from the local identity, from another process
pub fn check_handover_seal(
    seal: &HandoverSeal,
    local: &LocalNode,
    policy: &LocalPolicy,
    now: DateTime<Utc>,
) -> ConsensusResult<()> {
    seal.is_valid(&policy.network_id)?;
    if seal.address != *local.address() {
        return Err(AgoraError::invalid(format!("handover seal from other node, {}", seal.address)).into());
    }
    if seal.sign.signer != *local.public_key() {
        return Err(AgoraError::invalid("handover seal signed by other key").into());
    }

    let age = now - seal.sign.signed_at;
    let limit = chrono::Duration::from_std(policy.timespan_valid_ballot()).unwrap_or_else(|_| chrono::Duration::zero());
    if age > limit || -age > limit {
        return Err(AgoraError::invalid("handover seal is out of the valid timespan").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::{Proposal, Seal};
    use crate::processor::Block;
    use crate::test_utils::*;
    use agora_core::{Height, NodeState, SystemClock};
    use agora_crypto::Hash;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Remote answering with a fixed identity
    #[derive(Debug)]
    struct FakeNode {
        conn_info: String,
        info: NodeInfo,
        alive: AtomicBool,
        pings: AtomicUsize,
    }

    impl FakeNode {
        fn new(node: &LocalNode, conn_info: &str) -> Arc<Self> {
            Arc::new(Self {
                conn_info: conn_info.to_string(),
                info: NodeInfo {
                    address: node.address().clone(),
                    public_key: *node.public_key(),
                    network_id: network(),
                    state: NodeState::Consensus,
                    last_block: None,
                    conn_info: conn_info.to_string(),
                    nodes: Vec::new(),
                },
                alive: AtomicBool::new(true),
                pings: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Channel for FakeNode {
        fn conn_info(&self) -> &str {
            &self.conn_info
        }
        async fn send_seal(&self, _: &Seal) -> ConsensusResult<()> {
            Ok(())
        }
        async fn node_info(&self) -> ConsensusResult<NodeInfo> {
            if !self.alive.load(Ordering::SeqCst) {
                return Err(AgoraError::Connection("down".into()).into());
            }
            Ok(self.info.clone())
        }
        async fn seals(&self, _: &[Hash]) -> ConsensusResult<Vec<Seal>> {
            Ok(Vec::new())
        }
        async fn proposal_by_hash(&self, _: &Hash) -> ConsensusResult<Option<Proposal>> {
            Ok(None)
        }
        async fn blocks(&self, _: &[Height]) -> ConsensusResult<Vec<Block>> {
            Ok(Vec::new())
        }
        async fn ping_handover(&self, _: &HandoverSeal) -> ConsensusResult<bool> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        async fn end_handover(&self, _: &HandoverSeal) -> ConsensusResult<bool> {
            Ok(true)
        }
    }

    /// Loader handing out the fake old node for its address
    struct Loader(Arc<FakeNode>);

    #[async_trait]
    impl ChannelLoader for Loader {
        async fn load(&self, conn_info: &str) -> ConsensusResult<Arc<dyn Channel>> {
            if conn_info == self.0.conn_info {
                return Ok(self.0.clone());
            }
            Err(AgoraError::not_found(conn_info).into())
        }
    }

    fn policy() -> LocalPolicy {
        let mut p = LocalPolicy::default().with_network_id(network());
        p.interval_ping_handover_ms = 100;
        p.interval_keep_verify_duplicated_node_ms = 100;
        p
    }

    fn engine(nodes: &[LocalNode], old: Arc<FakeNode>) -> Arc<Handover> {
        let local = nodes[0].clone();
        let nodepool = Arc::new(Nodepool::new(local.clone()));
        Arc::new(
            Handover::new(
                "local://n0-new",
                local,
                policy(),
                nodepool,
                Arc::new(fixed_suffrage(nodes)),
                Arc::new(Loader(old.clone())),
                Arc::new(SystemClock),
            )
            .with_remote_channels(vec![old]),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_finds_old_node_and_pings() {
        let nodes = test_nodes(3);
        let old = FakeNode::new(&nodes[0], "local://n0");
        let hd = engine(&nodes, old.clone());

        hd.start().await.unwrap();
        assert!(hd.under_handover());
        assert!(!hd.is_ready());
        assert_eq!(hd.old_node().unwrap().conn_info(), "local://n0");

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(old.pings.load(Ordering::SeqCst) >= 3);

        hd.set_ready(true);
        assert!(hd.is_ready());

        hd.stop().await.unwrap();
        assert!(!hd.under_handover());
        assert!(!hd.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_duplicate_means_no_handover() {
        let nodes = test_nodes(3);
        let other = FakeNode::new(&nodes[1], "local://n1");
        let hd = engine(&nodes, other);

        hd.start().await.unwrap();
        assert!(!hd.under_handover());
        assert!(hd.old_node().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_conn_info_is_not_a_duplicate() {
        let nodes = test_nodes(3);
        let itself = FakeNode::new(&nodes[0], "local://n0-new");
        let hd = engine(&nodes, itself);

        hd.start().await.unwrap();
        assert!(!hd.under_handover());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_old_node_ends_handover() {
        let nodes = test_nodes(3);
        let old = FakeNode::new(&nodes[0], "local://n0");
        let hd = engine(&nodes, old.clone());

        hd.start().await.unwrap();
        assert!(hd.under_handover());

        old.alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert!(!hd.under_handover());
        assert!(!hd.is_running());
    }

    #[tokio::test]
    async fn test_outsider_never_under_handover() {
        let nodes = test_nodes(3);
        let old = FakeNode::new(&nodes[0], "local://n0");
        let local = nodes[0].clone();
        let others = &nodes[1..];

        let hd = Arc::new(
            Handover::new(
                "local://n0-new",
                local.clone(),
                policy(),
                Arc::new(Nodepool::new(local)),
                Arc::new(fixed_suffrage(others)),
                Arc::new(Loader(old.clone())),
                Arc::new(SystemClock),
            )
            .with_remote_channels(vec![old]),
        );

        hd.start().await.unwrap();
        assert!(!hd.under_handover());
    }

    #[test]
    fn test_handover_seal_identity() {
        let nodes = test_nodes(2);
        let p = policy();
        let seal = HandoverSeal::new(HandoverSealKind::End, &nodes[0], "local://n0-new", &network(), Utc::now());

        assert!(check_handover_seal(&seal, &nodes[0], &p, Utc::now()).is_ok());
        assert!(check_handover_seal(&seal, &nodes[1], &p, Utc::now()).is_err());
    }
}
