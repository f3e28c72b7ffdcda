//! Aggregation scenarios: end-to-end behaviour of ingest, debounce, drain and persistence
//!
//! Engines here run on a `ManualClock` unless a test exercises the debounce driver itself,
//! in which case tokio time is paused and advanced by hand.
//!
//! Run with: `cargo test --test aggregation_scenarios`

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use scribe_core::{
    AggregationEngine, CompletionSignal, DrainCoordinator, EngineConfig, FinalizedUtterance,
    FlushTrigger, Fragment, InMemoryMessageStore, JsonlMessageStore, LiveTransport, ManualClock,
    MessageId, PersistError, PersistenceGateway, RelayError, ScribeError, SpeakerRole,
    UtteranceKey,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn user(conversation: &str) -> UtteranceKey {
    UtteranceKey::new(conversation, SpeakerRole::User)
}

fn fast_retries() -> EngineConfig {
    EngineConfig {
        persist_retry_backoff_ms: 1,
        persist_retry_backoff_max_ms: 5,
        ..EngineConfig::default()
    }
}

fn manual_engine(
    config: EngineConfig,
    gateway: Arc<dyn PersistenceGateway>,
) -> (AggregationEngine, ManualClock) {
    init_tracing();
    let clock = ManualClock::new();
    let engine = AggregationEngine::with_clock(config, gateway, Arc::new(clock.clone()))
        .expect("start engine");
    (engine, clock)
}

fn contents(store: &InMemoryMessageStore, conversation: &str) -> Vec<String> {
    store
        .messages_for(conversation)
        .into_iter()
        .map(|m| m.utterance.content)
        .collect()
}

/// Rejects every write the same way.
struct FailingGateway {
    error: PersistError,
    calls: AtomicU32,
}

impl FailingGateway {
    fn new(error: PersistError) -> Self {
        Self {
            error,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PersistenceGateway for FailingGateway {
    async fn persist_message(&self, _: &FinalizedUtterance) -> Result<MessageId, PersistError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Fails transiently a fixed number of times before storing.
struct RecoveringGateway {
    failures_left: AtomicU32,
    store: InMemoryMessageStore,
}

#[async_trait]
impl PersistenceGateway for RecoveringGateway {
    async fn persist_message(&self, u: &FinalizedUtterance) -> Result<MessageId, PersistError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(PersistError::Transient("connection reset".to_string()));
        }
        self.store.persist_message(u).await
    }
}

struct BrokenSocket;

#[async_trait]
impl LiveTransport for BrokenSocket {
    async fn notify_fragment(&self, _: &str, _: SpeakerRole, _: &str) -> Result<(), RelayError> {
        Err(RelayError::Disconnected("client went away".to_string()))
    }
}

#[tokio::test]
async fn test_scenario_a_close_fragments_become_one_message() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, clock) = manual_engine(EngineConfig::default(), store.clone());

    engine
        .push_fragment("C1", SpeakerRole::User, "Hello", t(0), false)
        .expect("ingest");
    engine
        .push_fragment("C1", SpeakerRole::User, " world", t(1), false)
        .expect("ingest");

    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.flush_expired(), 1);
    engine.wait_persisted("C1").await;

    let messages = store.messages_for("C1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].utterance.content, "Hello world");
    assert_eq!(messages[0].utterance.timestamp, t(0));
    assert_eq!(messages[0].utterance.role, SpeakerRole::User);
}

#[tokio::test]
async fn test_scenario_b_quiet_period_then_new_utterance() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, clock) = manual_engine(EngineConfig::default(), store.clone());
    let key = user("C1");

    engine.ingest(key.clone(), Fragment::new("Hello", t(0))).expect("ingest");
    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.flush_expired(), 1);

    engine.ingest(key.clone(), Fragment::new("Goodbye", t(4))).expect("ingest");
    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.flush_expired(), 1);
    engine.wait_persisted("C1").await;

    let messages = store.messages_for("C1");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].utterance.content, "Hello");
    assert_eq!(messages[0].utterance.timestamp, t(0));
    assert_eq!(messages[1].utterance.content, "Goodbye");
    assert_eq!(messages[1].utterance.timestamp, t(4));
}

#[tokio::test]
async fn test_scenario_c_final_fragment_skips_debounce() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());

    engine
        .push_fragment("C2", SpeakerRole::Assistant, "Hi", t(0), true)
        .expect("ingest");
    engine.wait_persisted("C2").await;

    let messages = store.messages_for("C2");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].utterance.content, "Hi");
    assert_eq!(messages[0].utterance.role, SpeakerRole::Assistant);
    assert_eq!(engine.active_buffers(), 0);
}

#[tokio::test]
async fn test_scenario_d_drain_returns_after_persisting() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());

    engine.ingest(user("C3"), Fragment::new("Partial", t(0))).expect("ingest");
    let report = engine.drain("C3").await.expect("drain");

    assert!(report.is_complete());
    assert_eq!(report.persisted.len(), 1);
    assert_eq!(report.persisted[0].trigger, FlushTrigger::Drain);
    assert_eq!(contents(&store, "C3"), vec!["Partial"]);
}

#[tokio::test]
async fn test_gaps_past_window_split_into_separate_messages() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());
    let key = user("C1");

    // gaps: 1, 5, 2, 4, 3 -> two of them exceed the window
    let offsets = [0, 1, 6, 8, 12, 15];
    for (i, offset) in offsets.iter().enumerate() {
        engine
            .ingest(key.clone(), Fragment::new(format!("{}", i), t(*offset)))
            .expect("ingest");
    }
    engine.drain("C1").await.expect("drain");

    assert_eq!(contents(&store, "C1"), vec!["01", "23", "45"]);
    let timestamps: Vec<_> = store
        .messages_for("C1")
        .into_iter()
        .map(|m| m.utterance.timestamp)
        .collect();
    assert_eq!(timestamps, vec![t(0), t(6), t(12)]);
    assert_eq!(engine.stats().merge_gap_flushes, 2);
}

#[tokio::test]
async fn test_gap_of_exactly_the_window_still_merges() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());
    let key = user("C1");

    engine.ingest(key.clone(), Fragment::new("a", t(0))).expect("ingest");
    engine.ingest(key.clone(), Fragment::new("b", t(3))).expect("ingest");
    engine.drain("C1").await.expect("drain");

    assert_eq!(contents(&store, "C1"), vec!["ab"]);
}

#[tokio::test]
async fn test_out_of_order_fragment_merges_into_open_buffer() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());
    let key = user("C1");

    engine.ingest(key.clone(), Fragment::new("late ", t(5))).expect("ingest");
    engine.ingest(key.clone(), Fragment::new("early", t(2))).expect("ingest");
    // gap is measured from the newest timestamp seen
    engine.ingest(key.clone(), Fragment::new("!", t(8))).expect("ingest");
    engine.drain("C1").await.expect("drain");

    let messages = store.messages_for("C1");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].utterance.content, "late early!");
    assert_eq!(messages[0].utterance.timestamp, t(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_racing_debounce_flushes_exactly_once() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, clock) = manual_engine(EngineConfig::default(), store.clone());

    for round in 0..200 {
        let conversation = format!("race-{}", round);
        engine
            .ingest(user(&conversation), Fragment::new("Partial", t(0)))
            .expect("ingest");
        clock.advance(Duration::from_secs(2));

        let barrier = Arc::new(Barrier::new(2));
        let firing = {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                engine.flush_expired()
            })
        };
        barrier.wait();
        let report = engine.drain(&conversation).await.expect("drain");

        // stored by the time drain returns, whichever side closed the buffer
        assert_eq!(contents(&store, &conversation), vec!["Partial"], "round {}", round);
        let fired = firing.join().expect("timer thread");
        assert_eq!(report.persisted.len() + fired, 1, "round {}", round);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_racing_explicit_flush_waits_for_it() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());

    for round in 0..200 {
        let conversation = format!("flush-{}", round);
        let key = user(&conversation);
        engine
            .ingest(key.clone(), Fragment::new("Partial", t(0)))
            .expect("ingest");

        let barrier = Arc::new(Barrier::new(2));
        let flusher = {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                engine.flush(&key).expect("flush")
            })
        };
        barrier.wait();
        let report = engine.drain(&conversation).await.expect("drain");

        assert_eq!(contents(&store, &conversation), vec!["Partial"], "round {}", round);
        let flushed = flusher.join().expect("flush thread");
        assert_eq!(report.persisted.len() + usize::from(flushed), 1, "round {}", round);
    }
}

#[tokio::test]
async fn test_conversation_without_fragments_persists_nothing() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, clock) = manual_engine(EngineConfig::default(), store.clone());

    clock.advance(Duration::from_secs(10));
    assert_eq!(engine.flush_expired(), 0);
    let report = engine.drain("silent").await.expect("drain");

    assert!(report.persisted.is_empty());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_every_fragment_reaches_the_relay_once() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());

    let mut sent = 0;
    for (conversation, role) in [("C1", SpeakerRole::User), ("C1", SpeakerRole::Assistant), ("C2", SpeakerRole::User)] {
        for offset in [0, 1, 5, 6] {
            engine
                .push_fragment(conversation, role, "x", t(offset), offset == 6)
                .expect("ingest");
            sent += 1;
        }
    }

    let stats = engine.stats();
    assert_eq!(stats.fragments_ingested, sent);
    assert_eq!(stats.relay_notifications, sent);
}

#[tokio::test]
async fn test_relay_failures_do_not_affect_persistence() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());
    engine.relay().attach("C1", Arc::new(BrokenSocket));

    engine
        .push_fragment("C1", SpeakerRole::User, "still saved", t(0), true)
        .expect("ingest");
    let report = engine.drain("C1").await.expect("drain");

    assert!(report.is_complete());
    assert_eq!(contents(&store, "C1"), vec!["still saved"]);

    for _ in 0..100 {
        if engine.stats().relay_failures == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.stats().relay_failures, 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried_until_stored() {
    let gateway = Arc::new(RecoveringGateway {
        failures_left: AtomicU32::new(2),
        store: InMemoryMessageStore::new(),
    });
    let (engine, _clock) = manual_engine(fast_retries(), gateway.clone());

    engine.ingest(user("C1"), Fragment::new("eventually", t(0))).expect("ingest");
    let report = engine.drain("C1").await.expect("drain");

    assert!(report.is_complete());
    assert_eq!(contents(&gateway.store, "C1"), vec!["eventually"]);
    assert_eq!(engine.stats().persist_retries, 2);
}

#[tokio::test]
async fn test_permanent_failure_is_reported_by_drain_without_retry() {
    let gateway = Arc::new(FailingGateway::new(PersistError::Permanent(
        "conversation deleted".to_string(),
    )));
    let (engine, _clock) = manual_engine(fast_retries(), gateway.clone());

    engine.ingest(user("C1"), Fragment::new("doomed", t(0))).expect("ingest");
    let report = engine.drain("C1").await.expect("drain");

    assert_eq!(report.unsaved_count(), 1);
    let failure = &report.failed[0];
    assert_eq!(failure.utterance.content, "doomed");
    assert_eq!(failure.attempts, 1);
    assert!(!failure.cause.is_transient());
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);
    assert!(!engine.is_open(&user("C1")));
}

#[tokio::test]
async fn test_exhausted_retries_are_reported() {
    let gateway = Arc::new(FailingGateway::new(PersistError::Transient("timeout".to_string())));
    let (engine, _clock) = manual_engine(fast_retries(), gateway.clone());

    engine.ingest(user("C1"), Fragment::new("lost", t(0))).expect("ingest");
    let report = engine.drain("C1").await.expect("drain");

    assert_eq!(report.unsaved_count(), 1);
    assert_eq!(report.failed[0].attempts, 4);
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 4);
    assert_eq!(engine.stats().persist_failures, 1);
}

#[tokio::test]
async fn test_timer_flush_failure_appears_in_next_drain() {
    let gateway = Arc::new(FailingGateway::new(PersistError::Permanent("rejected".to_string())));
    let (engine, clock) = manual_engine(fast_retries(), gateway);

    engine.ingest(user("C1"), Fragment::new("unseen", t(0))).expect("ingest");
    clock.advance(Duration::from_secs(2));
    assert_eq!(engine.flush_expired(), 1);

    let report = engine.drain("C1").await.expect("drain");
    assert!(report.persisted.is_empty());
    assert_eq!(report.unsaved_count(), 1);
    assert_eq!(report.failed[0].trigger, FlushTrigger::QuietPeriod);

    // reported once
    let again = engine.drain("C1").await.expect("drain");
    assert!(again.is_complete());
}

#[tokio::test]
async fn test_completion_reports_unsaved_utterances() {
    let gateway = Arc::new(FailingGateway::new(PersistError::Permanent("rejected".to_string())));
    let (engine, _clock) = manual_engine(fast_retries(), gateway);
    let coordinator = Arc::new(DrainCoordinator::new(engine.clone()));

    engine.ingest(user("C1"), Fragment::new("one", t(0))).expect("ingest");
    engine
        .ingest(UtteranceKey::new("C1", SpeakerRole::Assistant), Fragment::new("two", t(0)))
        .expect("ingest");

    let (tx, _handle) = Arc::clone(&coordinator).listen();
    let (signal, reply) = CompletionSignal::with_reply("C1");
    tx.send(signal).expect("send completion");

    let report = reply.await.expect("reply").expect("completion");
    assert!(!report.is_clean());
    assert_eq!(report.to_string(), "conversation C1 completed with 2 unsaved utterances");
}

#[tokio::test]
async fn test_utterances_land_in_jsonl_files() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Arc::new(JsonlMessageStore::new(dir.path()));
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());

    engine
        .push_fragment("call-7", SpeakerRole::User, "What time ", t(0), false)
        .expect("ingest");
    engine
        .push_fragment("call-7", SpeakerRole::User, "is it?", t(1), true)
        .expect("ingest");
    engine
        .push_fragment("call-7", SpeakerRole::Assistant, "Noon.", t(2), true)
        .expect("ingest");
    engine.drain("call-7").await.expect("drain");

    let messages = store.load("call-7").await.expect("load");
    assert_eq!(messages.len(), 2);
    let user_message = messages
        .iter()
        .find(|m| m.utterance.role == SpeakerRole::User)
        .expect("user message");
    assert_eq!(user_message.utterance.content, "What time is it?");
}

#[tokio::test]
async fn test_shutdown_persists_open_buffers() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());

    engine.ingest(user("C1"), Fragment::new("pending", t(0))).expect("ingest");
    let reports = engine.shutdown().await.expect("shutdown");

    assert_eq!(reports.len(), 1);
    assert_eq!(contents(&store, "C1"), vec!["pending"]);
    assert!(matches!(
        engine.ingest(user("C1"), Fragment::new("late", t(1))),
        Err(ScribeError::EngineClosed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_racing_ingest_loses_nothing() {
    let store = Arc::new(InMemoryMessageStore::new());
    let (engine, _clock) = manual_engine(EngineConfig::default(), store.clone());
    let barrier = Arc::new(Barrier::new(5));

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                let mut accepted = 0usize;
                for i in 0..500 {
                    let conversation = format!("p{}-{}", producer, i);
                    match engine.push_fragment(&conversation, SpeakerRole::User, "x", t(0), i % 3 == 0) {
                        Ok(_) => accepted += 1,
                        Err(ScribeError::EngineClosed) => break,
                        Err(e) => panic!("unexpected ingest error: {}", e),
                    }
                }
                accepted
            })
        })
        .collect();

    barrier.wait();
    engine.shutdown().await.expect("shutdown");
    let accepted: usize = producers
        .into_iter()
        .map(|producer| producer.join().expect("producer thread"))
        .sum();

    // one conversation per fragment, so every accepted fragment is one stored message
    assert_eq!(store.len(), accepted);
    assert_eq!(engine.active_buffers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_debounce_driver_fires_after_quiet_period() {
    init_tracing();
    let store = Arc::new(InMemoryMessageStore::new());
    let engine = AggregationEngine::start(EngineConfig::default(), store.clone()).expect("start engine");
    let key = user("C1");

    engine.ingest(key.clone(), Fragment::new("Hel", t(0))).expect("ingest");
    tokio::time::advance(Duration::from_millis(1500)).await;
    engine.ingest(key.clone(), Fragment::new("lo", t(1))).expect("ingest");

    // first deadline passes, but the second fragment re-armed the timer
    tokio::time::advance(Duration::from_millis(1000)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(engine.is_open(&key));

    tokio::time::advance(Duration::from_millis(1100)).await;
    for _ in 0..100 {
        if !engine.is_open(&key) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!engine.is_open(&key));

    engine.wait_persisted("C1").await;
    assert_eq!(contents(&store, "C1"), vec!["Hello"]);
    engine.shutdown().await.expect("shutdown");
}
