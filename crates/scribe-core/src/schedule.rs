//! Debounce deadlines
//!
//! Flush timers are plain deadlines in a min-heap owned by the engine, not sleeping tasks.
//! Cancelling a timer just means the buffer stops pointing at its id; the stale heap entry
//! is discarded when it comes due. The engine's driver sleeps until the earliest deadline,
//! and tests skip the driver entirely and advance a [`ManualClock`].

use crate::sync::lock;
use crate::types::UtteranceKey;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Identifier of one scheduled flush timer. Never reused within an engine.
pub type TimerId = u64;

/// Source of real (operational) time for debounce decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's timer, so paused-time tests see virtual time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// One scheduled flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub timer: TimerId,
    pub key: UtteranceKey,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.timer.cmp(&other.timer))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of flush deadlines.
#[derive(Debug, Default)]
pub struct DeadlineQueue {
    heap: Mutex<BinaryHeap<Reverse<Deadline>>>,
    next_timer: AtomicU64,
    changed: Arc<Notify>,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a flush of `key` at `at` and wake the driver.
    pub fn schedule(&self, key: UtteranceKey, at: Instant) -> TimerId {
        let timer = self.next_timer.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.heap).push(Reverse(Deadline { at, timer, key }));
        self.changed.notify_one();
        timer
    }

    /// Remove and return every deadline due at `now`, earliest first. Stale entries are
    /// included; the caller checks them against the buffer.
    pub fn pop_due(&self, now: Instant) -> Vec<Deadline> {
        let mut heap = lock(&self.heap);
        let mut due = Vec::new();
        while heap.peek().is_some_and(|Reverse(d)| d.at <= now) {
            if let Some(Reverse(deadline)) = heap.pop() {
                due.push(deadline);
            }
        }
        due
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        lock(&self.heap).peek().map(|Reverse(d)| d.at)
    }

    pub fn len(&self) -> usize {
        lock(&self.heap).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signalled whenever a deadline is scheduled.
    pub fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }
}
