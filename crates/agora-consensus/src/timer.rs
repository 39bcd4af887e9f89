//! Timer fabric
//!
//! A `ContextTimer` runs a callback repeatedly on its own tokio task. The
//! wait before each firing is given by an interval function of the
//! iteration count, so a timer can fire immediately once and then settle
//! into a fixed period.
//!
//! ```text
//!   start ─► sleep(interval(0)) ─► callback(0) ─► sleep(interval(1)) ─► callback(1) ─► ...
//!                                      │
//!                                      └─ Ok(false) | Err(_) ─► stopped
//! ```
//!
//! `Timers` groups timers by id so a state can switch its whole set of
//! broadcasters at once.

use futures::future::BoxFuture;
use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use agora_core::AgoraError;

use crate::error::{ConsensusError, ConsensusResult};

/// Timer identifier
pub type TimerId = &'static str;

/// Shortest interval a timer accepts
pub const MIN_INTERVAL: Duration = Duration::from_nanos(1);

pub type IntervalFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;
pub type TimerCallback = Arc<dyn Fn(usize) -> BoxFuture<'static, ConsensusResult<bool>> + Send + Sync>;

/// Periodic named callback
pub struct ContextTimer {
    id: TimerId,
    interval: IntervalFn,
    callback: TimerCallback,
    count: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ContextTimer {
    /// Timer firing every `interval`. The callback returns whether the timer
    /// keeps running.
    pub fn new<F, Fut>(id: TimerId, interval: Duration, callback: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ConsensusResult<bool>> + Send + 'static,
    {
        Self {
            id,
            interval: Arc::new(move |_| interval),
            callback: Arc::new(move |i| callback(i).boxed()),
            count: Arc::new(AtomicUsize::new(0)),
            handle: Mutex::new(None),
        }
    }

    /// Replace the fixed interval with a per-iteration one
    pub fn with_interval<I>(mut self, interval: I) -> Self
    where
        I: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.interval = Arc::new(interval);
        self
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&self) -> ConsensusResult<()> {
        let mut handle = self.handle.lock();
        if let Some(h) = handle.as_ref() {
            if !h.is_finished() {
                return Ok(());
            }
        }

        let first = (self.interval)(0);
        if first < MIN_INTERVAL {
            return Err(ConsensusError::Timer {
                id: self.id.to_string(),
                reason: format!("too narrow interval, {:?}", first),
            });
        }

        let task = tokio::spawn(run(
            self.id,
            self.interval.clone(),
            self.callback.clone(),
            self.count.clone(),
        ));
        *handle = Some(task);

        trace!(timer = self.id, "timer started");
        Ok(())
    }

    pub fn stop(&self) -> ConsensusResult<()> {
        match self.handle.lock().take() {
            Some(h) if !h.is_finished() => {
                h.abort();
                trace!(timer = self.id, "timer stopped");
                Ok(())
            }
            _ => Err(AgoraError::DaemonAlreadyStopped.into()),
        }
    }

    /// Set the iteration count back to zero without stopping
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn restart(&self) -> ConsensusResult<()> {
        let _ = self.stop();
        self.reset();
        self.start()
    }
}

impl Drop for ContextTimer {
    fn drop(&mut self) {
        if let Some(h) = self.handle.get_mut().take() {
            h.abort();
        }
    }
}

async fn run(id: TimerId, interval: IntervalFn, callback: TimerCallback, count: Arc<AtomicUsize>) {
    loop {
        let i = count.load(Ordering::SeqCst);
        let wait = interval(i);
        if wait < MIN_INTERVAL {
            error!(timer = id, iteration = i, "too narrow interval; timer stopped");
            break;
        }

        tokio::time::sleep(wait).await;

        match callback(i).await {
            Ok(true) => {
                // a reset during the callback wins
                let _ = count.compare_exchange(i, i + 1, Ordering::SeqCst, Ordering::SeqCst);
            }
            Ok(false) => {
                debug!(timer = id, iteration = i, "timer finished by callback");
                break;
            }
            Err(e) if e.is_stop_timer() || e.is_ignore() => break,
            Err(e) => {
                error!(timer = id, iteration = i, error = %e, "timer callback failed");
                break;
            }
        }
    }
}

/// Collection of timers addressed by id
pub struct Timers {
    timers: Mutex<HashMap<TimerId, Option<Arc<ContextTimer>>>>,
    allow_new: bool,
}

impl Timers {
    pub fn new(ids: &[TimerId], allow_new: bool) -> Self {
        let timers = ids.iter().map(|id| (*id, None)).collect();
        Self {
            timers: Mutex::new(timers),
            allow_new,
        }
    }

    fn check_exists<'a>(
        &self,
        timers: &HashMap<TimerId, Option<Arc<ContextTimer>>>,
        ids: impl IntoIterator<Item = &'a TimerId>,
    ) -> ConsensusResult<()> {
        for id in ids {
            if !timers.contains_key(id) {
                return Err(AgoraError::not_found(format!("unknown timer id, {}", id)).into());
            }
        }
        Ok(())
    }

    /// Replace the timer with the same id; the old one is stopped
    pub fn set_timer(&self, timer: ContextTimer) -> ConsensusResult<()> {
        let mut timers = self.timers.lock();
        if !self.allow_new {
            self.check_exists(&timers, [&timer.id])?;
        }

        if let Some(Some(old)) = timers.get(timer.id) {
            let _ = old.stop();
        }
        timers.insert(timer.id, Some(Arc::new(timer)));
        Ok(())
    }

    /// Start the named timers; with `stop_others`, every other timer is
    /// stopped first
    pub fn start_timers(&self, ids: &[TimerId], stop_others: bool) -> ConsensusResult<()> {
        let mut timers = self.timers.lock();
        self.check_exists(&timers, ids.iter())?;

        if stop_others {
            for (id, slot) in timers.iter_mut() {
                if ids.contains(id) {
                    continue;
                }
                if let Some(t) = slot.take() {
                    let _ = t.stop();
                }
            }
        }

        for id in ids {
            if let Some(Some(t)) = timers.get(id) {
                t.start()?;
            }
        }
        Ok(())
    }

    /// Stop and drop the named timers
    pub fn stop_timers(&self, ids: &[TimerId]) -> ConsensusResult<()> {
        let mut timers = self.timers.lock();
        self.check_exists(&timers, ids.iter())?;

        for id in ids {
            if let Some(slot) = timers.get_mut(id) {
                if let Some(t) = slot.take() {
                    let _ = t.stop();
                }
            }
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        let mut timers = self.timers.lock();
        for slot in timers.values_mut() {
            if let Some(t) = slot.take() {
                let _ = t.stop();
            }
        }
    }

    pub fn reset_timer(&self, id: TimerId) -> ConsensusResult<()> {
        let timers = self.timers.lock();
        match timers.get(id) {
            Some(Some(t)) => {
                t.reset();
                Ok(())
            }
            Some(None) => Ok(()),
            None => Err(AgoraError::not_found(format!("unknown timer id, {}", id)).into()),
        }
    }

    pub fn is_timer_started(&self, id: TimerId) -> bool {
        matches!(self.timers.lock().get(id), Some(Some(t)) if t.is_started())
    }

    /// Ids of running timers
    pub fn started(&self) -> Vec<TimerId> {
        let mut ids: Vec<TimerId> = self
            .timers
            .lock()
            .iter()
            .filter_map(|(id, t)| match t {
                Some(t) if t.is_started() => Some(*id),
                _ => None,
            })
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_all();
    }
}
