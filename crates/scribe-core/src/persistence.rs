//! Ordered, non-blocking hand-off of flushed utterances to the gateway.
//!
//! Flushed utterances are queued on a fixed set of lanes, each drained by one worker task.
//! A key always hashes to the same lane, so flushes for one key persist in the order they
//! were triggered while unrelated keys proceed in parallel. A per-conversation ledger counts
//! in-flight flushes (so a drain can wait for flushes it did not start) and keeps failures
//! nobody was waiting for until the next drain collects them.

use crate::config::RetryPolicy;
use crate::error::{FlushFailure, ScribeError, ScribeResult};
use crate::gateway::PersistenceGateway;
use crate::stats::EngineStats;
use crate::sync::{lock, read, write};
use crate::types::{FinalizedUtterance, FlushTrigger, MessageId, UtteranceKey};
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// An utterance the gateway accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedUtterance {
    pub message_id: MessageId,
    pub utterance: FinalizedUtterance,
    pub trigger: FlushTrigger,
}

/// Result of one flush after retries.
pub type FlushOutcome = Result<PersistedUtterance, FlushFailure>;

/// One closed buffer on its way to the gateway.
pub(crate) struct FlushJob {
    pub utterance: FinalizedUtterance,
    pub trigger: FlushTrigger,
    /// Set when a caller waits for this particular flush.
    pub reply: Option<oneshot::Sender<FlushOutcome>>,
}

struct ConversationLedger {
    in_flight: watch::Sender<usize>,
    failures: Vec<FlushFailure>,
}

impl ConversationLedger {
    fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            in_flight,
            failures: Vec::new(),
        }
    }

    fn is_settled(&self) -> bool {
        *self.in_flight.borrow() == 0 && self.failures.is_empty()
    }
}

type Ledger = DashMap<String, ConversationLedger>;

pub(crate) struct PersistenceQueue {
    lanes: RwLock<Vec<mpsc::UnboundedSender<FlushJob>>>,
    ledger: Arc<Ledger>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistenceQueue {
    /// Spawn `lanes` workers. Must be called inside a tokio runtime.
    pub fn start(
        gateway: Arc<dyn PersistenceGateway>,
        policy: RetryPolicy,
        lanes: usize,
        stats: Arc<EngineStats>,
    ) -> Self {
        let ledger: Arc<Ledger> = Arc::new(DashMap::new());
        let mut senders = Vec::with_capacity(lanes);
        let mut workers = Vec::with_capacity(lanes);

        for lane in 0..lanes.max(1) {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            workers.push(tokio::spawn(run_lane(
                lane,
                rx,
                Arc::clone(&gateway),
                policy,
                Arc::clone(&ledger),
                Arc::clone(&stats),
            )));
        }

        info!(lanes = senders.len(), "persistence lanes started");

        Self {
            lanes: RwLock::new(senders),
            ledger,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a flushed utterance. Never blocks.
    pub fn submit(&self, job: FlushJob) -> ScribeResult<()> {
        let lanes = read(&self.lanes);
        if lanes.is_empty() {
            return Err(ScribeError::EngineClosed);
        }

        let conversation_id = job.utterance.conversation_id.clone();
        let lane = lane_for(&job.utterance.key(), lanes.len());

        self.ledger
            .entry(conversation_id.clone())
            .or_insert_with(ConversationLedger::new)
            .in_flight
            .send_modify(|n| *n += 1);

        if lanes[lane].send(job).is_err() {
            settle(&self.ledger, &conversation_id, None);
            return Err(ScribeError::EngineClosed);
        }
        Ok(())
    }

    /// Wait until no flush for the conversation is queued or running.
    pub async fn wait_idle(&self, conversation_id: &str) {
        let rx = self
            .ledger
            .get(conversation_id)
            .map(|entry| entry.in_flight.subscribe());

        if let Some(mut rx) = rx {
            // A closed channel means the ledger entry was settled and removed.
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }

    /// Take failures of flushes nobody was waiting for.
    pub fn take_failures(&self, conversation_id: &str) -> Vec<FlushFailure> {
        let failures = self
            .ledger
            .get_mut(conversation_id)
            .map(|mut entry| std::mem::take(&mut entry.failures))
            .unwrap_or_default();
        self.ledger
            .remove_if(conversation_id, |_, entry| entry.is_settled());
        failures
    }

    /// Conversations with failures waiting to be reported.
    pub fn conversations_with_failures(&self) -> Vec<String> {
        self.ledger
            .iter()
            .filter(|entry| !entry.failures.is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stop accepting jobs and wait for the workers to finish what is queued.
    pub async fn close(&self) {
        write(&self.lanes).clear();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "persistence lane ended abnormally");
            }
        }
    }
}

fn lane_for(key: &UtteranceKey, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

fn settle(ledger: &Ledger, conversation_id: &str, failure: Option<FlushFailure>) {
    if let Some(mut entry) = ledger.get_mut(conversation_id) {
        if let Some(failure) = failure {
            entry.failures.push(failure);
        }
        entry.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
    ledger.remove_if(conversation_id, |_, entry| entry.is_settled());
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::UnboundedReceiver<FlushJob>,
    gateway: Arc<dyn PersistenceGateway>,
    policy: RetryPolicy,
    ledger: Arc<Ledger>,
    stats: Arc<EngineStats>,
) {
    debug!(lane, "persistence lane running");

    while let Some(FlushJob {
        utterance,
        trigger,
        reply,
    }) = rx.recv().await
    {
        let conversation_id = utterance.conversation_id.clone();
        let outcome = persist_with_retry(gateway.as_ref(), utterance, trigger, &policy, &stats).await;

        let unreported = match reply {
            Some(reply) => match reply.send(outcome) {
                Ok(()) => None,
                Err(outcome) => outcome.err(),
            },
            None => outcome.err(),
        };
        settle(&ledger, &conversation_id, unreported);
    }

    debug!(lane, "persistence lane finished");
}

async fn persist_with_retry(
    gateway: &dyn PersistenceGateway,
    utterance: FinalizedUtterance,
    trigger: FlushTrigger,
    policy: &RetryPolicy,
    stats: &EngineStats,
) -> FlushOutcome {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match gateway.persist_message(&utterance).await {
            Ok(message_id) => {
                stats.record_persisted();
                info!(
                    conversation_id = %utterance.conversation_id,
                    role = %utterance.role,
                    %trigger,
                    %message_id,
                    chars = utterance.content.len(),
                    "utterance persisted"
                );
                return Ok(PersistedUtterance {
                    message_id,
                    utterance,
                    trigger,
                });
            }
            Err(cause) if cause.is_transient() && attempts <= policy.max_retries => {
                let backoff = policy.backoff_for(attempts);
                stats.record_retry();
                warn!(
                    conversation_id = %utterance.conversation_id,
                    role = %utterance.role,
                    attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %cause,
                    "transient persistence failure, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(cause) => {
                stats.record_persist_failure();
                error!(
                    conversation_id = %utterance.conversation_id,
                    role = %utterance.role,
                    %trigger,
                    attempts,
                    error = %cause,
                    "utterance could not be persisted"
                );
                return Err(FlushFailure {
                    utterance,
                    trigger,
                    attempts,
                    cause,
                });
            }
        }
    }
}
