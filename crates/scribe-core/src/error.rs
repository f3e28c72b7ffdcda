//! Error types for the Scribe aggregation engine

use crate::types::{FinalizedUtterance, FlushTrigger};
use thiserror::Error;

/// Result type alias for engine operations
pub type ScribeResult<T> = Result<T, ScribeError>;

/// Errors returned by the engine and its collaborators
#[derive(Error, Debug)]
pub enum ScribeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown speaker role: {0}")]
    InvalidRole(String),

    #[error("Engine is shut down")]
    EngineClosed,

    #[error("Conversation {0} is already being drained")]
    DuplicateCompletion(String),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<config::ConfigError> for ScribeError {
    fn from(err: config::ConfigError) -> Self {
        ScribeError::Config(err.to_string())
    }
}

/// Failure reported by a [`PersistenceGateway`](crate::gateway::PersistenceGateway).
///
/// Transient failures are retried with backoff; permanent ones are surfaced at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    #[error("transient persistence failure: {0}")]
    Transient(String),

    #[error("permanent persistence failure: {0}")]
    Permanent(String),
}

impl PersistError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PersistError::Transient(_))
    }
}

/// Failure delivering a fragment to a live transport. Always swallowed by the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("client disconnected: {0}")]
    Disconnected(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// An utterance that could not be persisted after all attempts.
#[derive(Error, Debug, Clone)]
#[error("failed to persist utterance for {}/{} after {attempts} attempt(s): {cause}", .utterance.conversation_id, .utterance.role)]
pub struct FlushFailure {
    pub utterance: FinalizedUtterance,
    pub trigger: FlushTrigger,
    pub attempts: u32,
    pub cause: PersistError,
}
