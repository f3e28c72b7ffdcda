//! Shared types: keys, fragments, and finalized utterances.

use crate::error::ScribeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Independent speaker stream within a conversation. Fragments of different roles never
/// merge into one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    User,
    Assistant,
}

impl SpeakerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for SpeakerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeakerRole {
    type Err = ScribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(ScribeError::InvalidRole(other.to_string())),
        }
    }
}

/// `(conversation, role)`: identifies at most one live buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtteranceKey {
    pub conversation_id: String,
    pub role: SpeakerRole,
}

impl UtteranceKey {
    pub fn new(conversation_id: impl Into<String>, role: SpeakerRole) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
        }
    }
}

impl fmt::Display for UtteranceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conversation_id, self.role)
    }
}

/// One incremental piece of recognized speech pushed by the upstream provider.
///
/// `event_timestamp` is business time supplied by the producer, not arrival time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub event_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_final: bool,
}

impl Fragment {
    pub fn new(text: impl Into<String>, event_timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            event_timestamp,
            is_final: false,
        }
    }

    /// Marks the fragment as the end of its burst (e.g. end of speech detected upstream).
    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// Identifier assigned by the persistence gateway to a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The durable artifact: one complete utterance ready for the gateway.
///
/// `timestamp` is the business time of the *first* fragment, not the flush time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedUtterance {
    pub conversation_id: String,
    pub role: SpeakerRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl FinalizedUtterance {
    pub fn key(&self) -> UtteranceKey {
        UtteranceKey::new(self.conversation_id.clone(), self.role)
    }
}

/// What closed a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// No fragment arrived for the quiet period.
    QuietPeriod,
    /// The fragment carried `is_final`.
    FinalFragment,
    /// The next fragment came after the merge window and started a new utterance.
    MergeGap,
    /// The conversation ended.
    Drain,
    /// A caller asked for the flush directly.
    Explicit,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuietPeriod => "quiet_period",
            Self::FinalFragment => "final_fragment",
            Self::MergeGap => "merge_gap",
            Self::Drain => "drain",
            Self::Explicit => "explicit",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
