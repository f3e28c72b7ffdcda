//! Drain Coordinator - flushes a conversation once when it completes.
//!
//! Completion arrives either as a direct [`DrainCoordinator::complete`] call or as a
//! [`CompletionSignal`] on the lifecycle channel consumed by [`DrainCoordinator::run`].

use crate::engine::{AggregationEngine, DrainReport};
use crate::error::{FlushFailure, ScribeError, ScribeResult};
use crate::persistence::PersistedUtterance;
use dashmap::DashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Result of completing a conversation.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub conversation_id: String,
    pub persisted: Vec<PersistedUtterance>,
    pub unsaved: Vec<FlushFailure>,
}

impl CompletionReport {
    pub fn is_clean(&self) -> bool {
        self.unsaved.is_empty()
    }
}

impl From<DrainReport> for CompletionReport {
    fn from(report: DrainReport) -> Self {
        Self {
            conversation_id: report.conversation_id,
            persisted: report.persisted,
            unsaved: report.failed,
        }
    }
}

impl fmt::Display for CompletionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "conversation {} completed", self.conversation_id)
        } else {
            write!(
                f,
                "conversation {} completed with {} unsaved utterances",
                self.conversation_id,
                self.unsaved.len()
            )
        }
    }
}

/// A conversation-completed event from the lifecycle bus.
#[derive(Debug)]
pub struct CompletionSignal {
    pub conversation_id: String,
    pub reply: Option<oneshot::Sender<ScribeResult<CompletionReport>>>,
}

impl CompletionSignal {
    /// Signal without a reply channel.
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            reply: None,
        }
    }

    /// Signal whose outcome is sent back on the returned receiver.
    pub fn with_reply(
        conversation_id: impl Into<String>,
    ) -> (Self, oneshot::Receiver<ScribeResult<CompletionReport>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                conversation_id: conversation_id.into(),
                reply: Some(tx),
            },
            rx,
        )
    }
}

pub struct DrainCoordinator {
    engine: AggregationEngine,
    in_progress: DashSet<String>,
}

/// Clears the in-progress mark even if the completing future is dropped.
struct InProgress<'a> {
    set: &'a DashSet<String>,
    conversation_id: &'a str,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.set.remove(self.conversation_id);
    }
}

impl DrainCoordinator {
    pub fn new(engine: AggregationEngine) -> Self {
        Self {
            engine,
            in_progress: DashSet::new(),
        }
    }

    /// Drain the conversation once. Rejected while another completion of the same
    /// conversation is still draining.
    pub async fn complete(&self, conversation_id: &str) -> ScribeResult<CompletionReport> {
        if !self.in_progress.insert(conversation_id.to_string()) {
            warn!(conversation_id, "completion already in progress");
            return Err(ScribeError::DuplicateCompletion(conversation_id.to_string()));
        }
        let _guard = InProgress {
            set: &self.in_progress,
            conversation_id,
        };

        match self.engine.drain(conversation_id).await {
            Ok(report) => {
                let report = CompletionReport::from(report);
                if report.is_clean() {
                    info!(conversation_id, persisted = report.persisted.len(), "{report}");
                } else {
                    warn!(conversation_id, unsaved = report.unsaved.len(), "{report}");
                }
                Ok(report)
            }
            Err(e) => {
                error!(conversation_id, error = %e, "conversation drain failed");
                Err(e)
            }
        }
    }

    /// Consume completion signals until every sender is dropped. Each signal is handled on
    /// its own task so one slow drain does not hold up other conversations.
    pub async fn run(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<CompletionSignal>) {
        info!("drain coordinator listening for completions");
        while let Some(CompletionSignal {
            conversation_id,
            reply,
        }) = signals.recv().await
        {
            let coordinator = Arc::clone(&self);
            tokio::spawn(async move {
                let result = coordinator.complete(&conversation_id).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            });
        }
        info!("completion channel closed, drain coordinator stopped");
    }

    /// Spawn [`run`](Self::run) and return the sending side of its channel.
    pub fn listen(self: Arc<Self>) -> (mpsc::UnboundedSender<CompletionSignal>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }
}
