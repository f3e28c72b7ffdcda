//! Counters for diagnostics: ingest volume, relay health, flush causes, persistence outcomes.

use crate::types::FlushTrigger;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineStats {
    fragments_ingested: AtomicU64,
    relay_notifications: AtomicU64,
    relay_failures: AtomicU64,
    quiet_period_flushes: AtomicU64,
    final_fragment_flushes: AtomicU64,
    merge_gap_flushes: AtomicU64,
    drain_flushes: AtomicU64,
    explicit_flushes: AtomicU64,
    utterances_persisted: AtomicU64,
    persist_retries: AtomicU64,
    persist_failures: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub fragments_ingested: u64,
    pub relay_notifications: u64,
    pub relay_failures: u64,
    pub quiet_period_flushes: u64,
    pub final_fragment_flushes: u64,
    pub merge_gap_flushes: u64,
    pub drain_flushes: u64,
    pub explicit_flushes: u64,
    pub utterances_persisted: u64,
    pub persist_retries: u64,
    pub persist_failures: u64,
}

impl StatsSnapshot {
    /// Buffers closed for any reason.
    pub fn total_flushes(&self) -> u64 {
        self.quiet_period_flushes
            + self.final_fragment_flushes
            + self.merge_gap_flushes
            + self.drain_flushes
            + self.explicit_flushes
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_fragment(&self) {
        self.fragments_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relay_notification(&self) {
        self.relay_notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_relay_failure(&self) {
        self.relay_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, trigger: FlushTrigger) {
        let counter = match trigger {
            FlushTrigger::QuietPeriod => &self.quiet_period_flushes,
            FlushTrigger::FinalFragment => &self.final_fragment_flushes,
            FlushTrigger::MergeGap => &self.merge_gap_flushes,
            FlushTrigger::Drain => &self.drain_flushes,
            FlushTrigger::Explicit => &self.explicit_flushes,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persisted(&self) {
        self.utterances_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.persist_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fragments_ingested: self.fragments_ingested.load(Ordering::Relaxed),
            relay_notifications: self.relay_notifications.load(Ordering::Relaxed),
            relay_failures: self.relay_failures.load(Ordering::Relaxed),
            quiet_period_flushes: self.quiet_period_flushes.load(Ordering::Relaxed),
            final_fragment_flushes: self.final_fragment_flushes.load(Ordering::Relaxed),
            merge_gap_flushes: self.merge_gap_flushes.load(Ordering::Relaxed),
            drain_flushes: self.drain_flushes.load(Ordering::Relaxed),
            explicit_flushes: self.explicit_flushes.load(Ordering::Relaxed),
            utterances_persisted: self.utterances_persisted.load(Ordering::Relaxed),
            persist_retries: self.persist_retries.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}
