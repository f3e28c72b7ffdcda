//! Aggregation Engine - turns fragment bursts into utterances
//!
//! ```text
//! fragment ──► LiveRelay (always, fire-and-forget)
//!     │
//!     ▼
//! key slot lock ──► open / merge / split ──► re-arm quiet-period deadline
//!     │                                   │
//!     │ is_final                          ▼ deadline due (debounce driver)
//!     ▼                                   │
//! flush: take buffer + retire slot ◄──────┘◄── drain(conversation)
//!     │
//!     ▼
//! PersistenceQueue lane (ordered per key) ──► PersistenceGateway
//! ```
//!
//! Every operation on a key runs under that key's slot lock, so a deadline firing never
//! races an ingest for the same key. A flush queues the buffer for persistence and retires the
//! slot in one step; an ingest that lands on a retired slot retries against a fresh one.

use crate::buffer::{GapDecision, UtteranceBuffer};
use crate::config::EngineConfig;
use crate::error::{FlushFailure, ScribeError, ScribeResult};
use crate::gateway::PersistenceGateway;
use crate::persistence::{FlushJob, FlushOutcome, PersistedUtterance, PersistenceQueue};
use crate::relay::LiveRelay;
use crate::schedule::{Clock, DeadlineQueue, TimerId, TokioClock};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::sync::{lock, read, write};
use crate::types::{Fragment, FlushTrigger, SpeakerRole, UtteranceKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What an ingested fragment did to its key's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// No live buffer: the fragment opened one.
    Opened,
    /// Appended to the live buffer.
    Merged,
    /// Past the merge window: the old buffer was flushed and a new one opened.
    Split,
}

/// Outcome of draining one conversation.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub conversation_id: String,
    /// Utterances closed by this drain and stored.
    pub persisted: Vec<PersistedUtterance>,
    /// Utterances of this conversation that could not be stored, including earlier
    /// quiet-period or final-fragment flushes that failed since the last drain.
    pub failed: Vec<FlushFailure>,
}

impl DrainReport {
    fn new(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn unsaved_count(&self) -> usize {
        self.failed.len()
    }
}

#[derive(Default)]
struct KeySlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    buffer: Option<UtteranceBuffer>,
    /// Set once the slot's buffer is flushed; the slot is gone from the map.
    retired: bool,
}

struct EngineInner {
    config: EngineConfig,
    merge_window: chrono::Duration,
    quiet_period: Duration,
    clock: Arc<dyn Clock>,
    slots: DashMap<UtteranceKey, Arc<KeySlot>>,
    deadlines: DeadlineQueue,
    relay: LiveRelay,
    persistence: PersistenceQueue,
    stats: Arc<EngineStats>,
    /// Held shared by every ingest; shutdown takes it exclusively to close the engine.
    admission: RwLock<()>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every live utterance buffer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AggregationEngine {
    inner: Arc<EngineInner>,
}

impl AggregationEngine {
    /// Start an engine on real time with its debounce driver running.
    /// Must be called inside a tokio runtime.
    pub fn start(config: EngineConfig, gateway: Arc<dyn PersistenceGateway>) -> ScribeResult<Self> {
        let engine = Self::with_clock(config, gateway, Arc::new(TokioClock))?;
        engine.spawn_debounce_driver();
        Ok(engine)
    }

    /// Start an engine without a debounce driver; the caller fires deadlines with
    /// [`flush_expired`](Self::flush_expired). Must be called inside a tokio runtime.
    pub fn with_clock(
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        clock: Arc<dyn Clock>,
    ) -> ScribeResult<Self> {
        config.validate()?;

        let stats = Arc::new(EngineStats::new());
        let relay = LiveRelay::start(Arc::clone(&stats));
        let persistence = PersistenceQueue::start(
            gateway,
            config.retry_policy(),
            config.persistence_workers,
            Arc::clone(&stats),
        );
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            merge_window_ms = config.merge_window().num_milliseconds(),
            quiet_period_ms = config.flush_quiet_period().as_millis() as u64,
            lanes = config.persistence_workers,
            "aggregation engine started"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                merge_window: config.merge_window(),
                quiet_period: config.flush_quiet_period(),
                config,
                clock,
                slots: DashMap::new(),
                deadlines: DeadlineQueue::new(),
                relay,
                persistence,
                stats,
                admission: RwLock::new(()),
                closed: AtomicBool::new(false),
                shutdown_tx,
                driver: Mutex::new(None),
            }),
        })
    }

    /// Spawn the task that fires quiet-period deadlines as they come due. Only meaningful
    /// with a clock that follows tokio time.
    fn spawn_debounce_driver(&self) {
        let handle = tokio::spawn(run_debounce_driver(
            Arc::downgrade(&self.inner),
            self.inner.deadlines.changed(),
            self.inner.shutdown_tx.subscribe(),
        ));
        *lock(&self.inner.driver) = Some(handle);
    }

    /// Ingest one fragment for `key`.
    ///
    /// The fragment is relayed for live display first, then merged into the key's buffer,
    /// used to open a new one, or (past the merge window) used to close the old buffer and
    /// open a new one. The quiet-period timer is re-armed; a final fragment flushes at once.
    pub fn ingest(&self, key: UtteranceKey, fragment: Fragment) -> ScribeResult<MergeAction> {
        self.inner.ingest(key, fragment)
    }

    /// Fragment ingress in the shape the speech-to-text callback delivers it.
    pub fn push_fragment(
        &self,
        conversation_id: &str,
        role: SpeakerRole,
        text: &str,
        event_timestamp: DateTime<Utc>,
        is_final: bool,
    ) -> ScribeResult<MergeAction> {
        let fragment = Fragment {
            text: text.to_string(),
            event_timestamp,
            is_final,
        };
        self.ingest(UtteranceKey::new(conversation_id, role), fragment)
    }

    /// Flush the key's buffer now. Returns `false` when no buffer was live.
    pub fn flush(&self, key: &UtteranceKey) -> ScribeResult<bool> {
        self.inner
            .close_buffer(key, FlushTrigger::Explicit, None, None)
    }

    /// Fire every quiet-period deadline that is due. Returns the number of buffers flushed.
    pub fn flush_expired(&self) -> usize {
        self.inner.flush_expired()
    }

    /// Flush every live buffer of the conversation and wait until all of them, and any
    /// flush of the conversation already in flight, are persisted or failed.
    pub async fn drain(&self, conversation_id: &str) -> ScribeResult<DrainReport> {
        let keys: Vec<UtteranceKey> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.key().conversation_id == conversation_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut pending: Vec<oneshot::Receiver<FlushOutcome>> = Vec::with_capacity(keys.len());
        for key in &keys {
            let (tx, rx) = oneshot::channel();
            if self
                .inner
                .close_buffer(key, FlushTrigger::Drain, None, Some(tx))?
            {
                pending.push(rx);
            }
        }

        let mut report = DrainReport::new(conversation_id);
        for rx in pending {
            match rx.await {
                Ok(Ok(persisted)) => report.persisted.push(persisted),
                Ok(Err(failure)) => report.failed.push(failure),
                Err(_) => return Err(ScribeError::EngineClosed),
            }
        }

        self.inner.persistence.wait_idle(conversation_id).await;
        report
            .failed
            .extend(self.inner.persistence.take_failures(conversation_id));

        info!(
            conversation_id,
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            "conversation drained"
        );
        Ok(report)
    }

    /// Drain every conversation with a live buffer or an unreported failure.
    pub async fn drain_all(&self) -> ScribeResult<Vec<DrainReport>> {
        let mut conversations: BTreeSet<String> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.key().conversation_id.clone())
            .collect();
        conversations.extend(self.inner.persistence.conversations_with_failures());

        let mut reports = Vec::with_capacity(conversations.len());
        for conversation_id in conversations {
            reports.push(self.drain(&conversation_id).await?);
        }
        Ok(reports)
    }

    /// Wait until every flush already triggered for the conversation has completed.
    pub async fn wait_persisted(&self, conversation_id: &str) {
        self.inner.persistence.wait_idle(conversation_id).await;
    }

    /// Refuse new fragments, stop the debounce driver, drain everything, and wait for the
    /// persistence lanes to finish. Calling it again is a no-op.
    pub async fn shutdown(&self) -> ScribeResult<Vec<DrainReport>> {
        let already_closed = {
            let _gate = write(&self.inner.admission);
            self.inner.closed.swap(true, Ordering::AcqRel)
        };
        if already_closed {
            return Ok(Vec::new());
        }
        info!("aggregation engine shutting down");

        self.inner.shutdown_tx.send_replace(true);
        let driver = lock(&self.inner.driver).take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        // No ingest is running past this point, so one pass sees every buffer.
        let reports = self.drain_all().await?;

        self.inner.persistence.close().await;
        self.inner.relay.stop().await;

        let stats = self.stats();
        info!(
            fragments = stats.fragments_ingested,
            persisted = stats.utterances_persisted,
            failures = stats.persist_failures,
            "aggregation engine stopped"
        );
        Ok(reports)
    }

    /// True when `key` has a live buffer.
    pub fn is_open(&self, key: &UtteranceKey) -> bool {
        let slot = self
            .inner
            .slots
            .get(key)
            .map(|entry| Arc::clone(entry.value()));
        slot.is_some_and(|slot| {
            let state = lock(&slot.state);
            state.buffer.is_some()
        })
    }

    /// Number of live buffers across all conversations.
    pub fn active_buffers(&self) -> usize {
        let slots: Vec<Arc<KeySlot>> = self
            .inner
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        slots
            .iter()
            .filter(|slot| lock(&slot.state).buffer.is_some())
            .count()
    }

    pub fn relay(&self) -> &LiveRelay {
        &self.inner.relay
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl EngineInner {
    fn ingest(&self, key: UtteranceKey, fragment: Fragment) -> ScribeResult<MergeAction> {
        let _admitted = read(&self.admission);
        if self.closed.load(Ordering::Acquire) {
            return Err(ScribeError::EngineClosed);
        }

        self.stats.record_fragment();
        self.relay.notify(&key, &fragment.text);

        loop {
            let slot = self.slot_for(&key);
            let mut state = lock(&slot.state);
            if state.retired {
                continue;
            }

            let decision = state
                .buffer
                .as_ref()
                .map(|buffer| buffer.decide(fragment.event_timestamp, self.merge_window));

            let action = match decision {
                None => {
                    state.buffer = Some(UtteranceBuffer::open(key.clone(), &fragment));
                    MergeAction::Opened
                }
                Some(GapDecision::Merge) => {
                    if let Some(buffer) = state.buffer.as_mut() {
                        buffer.merge(&fragment);
                    }
                    MergeAction::Merged
                }
                Some(GapDecision::Split { gap }) => {
                    if let Some(mut previous) = state.buffer.take() {
                        previous.disarm();
                        debug!(
                            key = %key,
                            gap_ms = gap.num_milliseconds(),
                            "merge window exceeded, closing utterance"
                        );
                        self.submit(previous, FlushTrigger::MergeGap, None)?;
                    }
                    state.buffer = Some(UtteranceBuffer::open(key.clone(), &fragment));
                    MergeAction::Split
                }
            };

            if fragment.is_final {
                if let Some(mut buffer) = state.buffer.take() {
                    buffer.disarm();
                    self.submit(buffer, FlushTrigger::FinalFragment, None)?;
                    state.retired = true;
                    self.retire_slot(&key, &slot);
                }
                return Ok(action);
            }

            let at = self.clock.now() + self.quiet_period;
            let timer = self.deadlines.schedule(key.clone(), at);
            if let Some(buffer) = state.buffer.as_mut() {
                buffer.arm(timer);
            }
            return Ok(action);
        }
    }

    fn slot_for(&self, key: &UtteranceKey) -> Arc<KeySlot> {
        let entry = self
            .slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeySlot::default()));
        Arc::clone(entry.value())
    }

    /// Remove the slot from the map unless a successor already replaced it.
    fn retire_slot(&self, key: &UtteranceKey, slot: &Arc<KeySlot>) {
        self.slots
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Take the key's buffer and hand it to persistence.
    ///
    /// With `expected_timer`, only flush if that timer is still the buffer's live one; a
    /// fragment that re-armed the buffer first wins.
    fn close_buffer(
        &self,
        key: &UtteranceKey,
        trigger: FlushTrigger,
        expected_timer: Option<TimerId>,
        reply: Option<oneshot::Sender<FlushOutcome>>,
    ) -> ScribeResult<bool> {
        let Some(slot) = self.slots.get(key).map(|entry| Arc::clone(entry.value())) else {
            return Ok(false);
        };

        let mut state = lock(&slot.state);
        if state.retired {
            return Ok(false);
        }
        if let Some(timer) = expected_timer {
            let armed = state
                .buffer
                .as_ref()
                .is_some_and(|buffer| buffer.is_armed_with(timer));
            if !armed {
                return Ok(false);
            }
        }
        let Some(mut buffer) = state.buffer.take() else {
            return Ok(false);
        };

        // Queue before retiring: a drain that no longer finds the slot must find the
        // flush counted as in flight.
        buffer.disarm();
        self.submit(buffer, trigger, reply)?;
        state.retired = true;
        self.retire_slot(key, &slot);
        Ok(true)
    }

    fn submit(
        &self,
        buffer: UtteranceBuffer,
        trigger: FlushTrigger,
        reply: Option<oneshot::Sender<FlushOutcome>>,
    ) -> ScribeResult<()> {
        let fragments = buffer.fragment_count();
        let utterance = buffer.finalize();
        debug!(
            conversation_id = %utterance.conversation_id,
            role = %utterance.role,
            %trigger,
            fragments,
            "utterance closed"
        );
        self.stats.record_flush(trigger);
        self.persistence.submit(FlushJob {
            utterance,
            trigger,
            reply,
        })
    }

    fn flush_expired(&self) -> usize {
        let now = self.clock.now();
        let mut flushed = 0;
        for deadline in self.deadlines.pop_due(now) {
            match self.close_buffer(
                &deadline.key,
                FlushTrigger::QuietPeriod,
                Some(deadline.timer),
                None,
            ) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %deadline.key, error = %e, "quiet-period flush failed"),
            }
        }
        flushed
    }
}

async fn run_debounce_driver(
    inner: Weak<EngineInner>,
    changed: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("debounce driver started");
    loop {
        let next = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.flush_expired();
            inner.deadlines.next_deadline()
        };

        let sleep = async {
            match next {
                Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = sleep => {}
            _ = changed.notified() => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("debounce driver stopped");
}
