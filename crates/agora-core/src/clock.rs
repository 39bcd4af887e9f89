//! Wall clock abstraction
//!
//! Consensus code never reads the system time directly. A `Clock` is passed
//! in at construction, so a node can run on an offset (network-synchronized)
//! clock in production and on a manual clock in tests.

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Source of the current UTC time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The operating system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// System clock shifted by an offset, updated by a time synchronizer
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset: RwLock<ChronoDuration>,
}

impl OffsetClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offset(&self, offset: ChronoDuration) {
        let mut o = self.offset.write();
        if *o != offset {
            tracing::debug!(offset_ms = offset.num_milliseconds(), "clock offset updated");
        }
        *o = offset;
    }

    pub fn offset(&self) -> ChronoDuration {
        *self.offset.read()
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.write() = t;
    }

    pub fn advance(&self, d: ChronoDuration) {
        let mut now = self.now.write();
        *now = *now + d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// The zero timestamp; a signed item carrying it is rejected
pub fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::default()
}

pub fn is_zero_time(t: &DateTime<Utc>) -> bool {
    *t == zero_time()
}

/// RFC3339 with nanoseconds, the form mixed into signatures and hashes
pub fn time_bytes(t: &DateTime<Utc>) -> Vec<u8> {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true).into_bytes()
}
