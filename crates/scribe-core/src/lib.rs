//! # Scribe - Fragment Aggregation for Voice Conversations
//!
//! Speech-to-text engines emit many small fragments per spoken turn. Scribe relays every
//! fragment to the live client at once, merges the fragments of one speaker into a single
//! utterance, and persists that utterance exactly once when the speaker goes quiet, says
//! something final, or the conversation ends.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Aggregation Engine                           │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────────┐    │
//! │  │   Fragment   │→ │ Utterance Buffer │→ │ Persistence Lane │ →  │ Gateway
//! │  │   (ingest)   │  │ (3s merge window)│  │  (ordered/key)   │    │
//! │  └──────────────┘  └──────────────────┘  └──────────────────┘    │
//! │         ↓                  ↑                      ↑               │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌──────────────────┐    │
//! │  │  Live Relay  │  │ Debounce Driver  │  │ Drain Coordinator│    │
//! │  │ (best effort)│  │  (2s quiet time) │  │  (completion)    │    │
//! │  └──────────────┘  └──────────────────┘  └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Merge decisions use the fragments' business timestamps; the quiet period uses real
//! elapsed time.

pub mod buffer;
pub mod config;
pub mod drain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod persistence;
pub mod relay;
pub mod schedule;
pub mod stats;
pub mod types;

mod sync;

pub use buffer::{GapDecision, UtteranceBuffer};
pub use config::{EngineConfig, RetryPolicy};
pub use drain::{CompletionReport, CompletionSignal, DrainCoordinator};
pub use engine::{AggregationEngine, DrainReport, MergeAction};
pub use error::{FlushFailure, PersistError, RelayError, ScribeError, ScribeResult};
pub use gateway::{InMemoryMessageStore, JsonlMessageStore, PersistenceGateway, StoredMessage};
pub use persistence::{FlushOutcome, PersistedUtterance};
pub use relay::{LiveRelay, LiveTransport};
pub use schedule::{Clock, ManualClock, TokioClock};
pub use stats::{EngineStats, StatsSnapshot};
pub use types::{FinalizedUtterance, FlushTrigger, Fragment, MessageId, SpeakerRole, UtteranceKey};
