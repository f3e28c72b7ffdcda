//! Per-key utterance buffer
//!
//! Holds the text accumulated for one not-yet-flushed utterance and implements the
//! "Gap Logic" on business timestamps: a fragment within the merge window of the last merged
//! fragment continues the utterance, anything later starts a new one.

use crate::schedule::TimerId;
use crate::types::{FinalizedUtterance, Fragment, UtteranceKey};
use chrono::{DateTime, Utc};

/// How an incoming fragment relates to a live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapDecision {
    /// Within the merge window: append to the buffer.
    Merge,
    /// Past the merge window: the buffer is complete.
    Split { gap: chrono::Duration },
}

/// In-progress accumulation state for one utterance.
///
/// Invariant: `opened_at <= last_merged_at`.
#[derive(Debug)]
pub struct UtteranceBuffer {
    key: UtteranceKey,
    content: String,
    opened_at: DateTime<Utc>,
    last_merged_at: DateTime<Utc>,
    fragment_count: usize,
    pending_flush: Option<TimerId>,
}

impl UtteranceBuffer {
    /// Open a buffer with its first fragment.
    pub fn open(key: UtteranceKey, fragment: &Fragment) -> Self {
        Self {
            key,
            content: fragment.text.clone(),
            opened_at: fragment.event_timestamp,
            last_merged_at: fragment.event_timestamp,
            fragment_count: 1,
            pending_flush: None,
        }
    }

    /// Compare a fragment's business time against the last merged fragment.
    ///
    /// A fragment older than `last_merged_at` has a negative gap and merges.
    pub fn decide(&self, event_timestamp: DateTime<Utc>, merge_window: chrono::Duration) -> GapDecision {
        let gap = event_timestamp - self.last_merged_at;
        if gap > merge_window {
            GapDecision::Split { gap }
        } else {
            GapDecision::Merge
        }
    }

    /// Append a fragment. `last_merged_at` never moves backwards.
    pub fn merge(&mut self, fragment: &Fragment) {
        self.content.push_str(&fragment.text);
        if fragment.event_timestamp > self.last_merged_at {
            self.last_merged_at = fragment.event_timestamp;
        }
        self.fragment_count += 1;
    }

    /// Replace the pending flush timer, returning the cancelled one.
    pub(crate) fn arm(&mut self, timer: TimerId) -> Option<TimerId> {
        self.pending_flush.replace(timer)
    }

    /// Cancel the pending flush timer.
    pub(crate) fn disarm(&mut self) -> Option<TimerId> {
        self.pending_flush.take()
    }

    /// True when `timer` is the live flush timer for this buffer.
    pub(crate) fn is_armed_with(&self, timer: TimerId) -> bool {
        self.pending_flush == Some(timer)
    }

    pub fn key(&self) -> &UtteranceKey {
        &self.key
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn last_merged_at(&self) -> DateTime<Utc> {
        self.last_merged_at
    }

    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    /// Consume the buffer into the message handed to persistence.
    pub fn finalize(self) -> FinalizedUtterance {
        FinalizedUtterance {
            conversation_id: self.key.conversation_id,
            role: self.key.role,
            content: self.content,
            timestamp: self.opened_at,
        }
    }
}
