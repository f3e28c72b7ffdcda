//! **Live Relay** - best-effort fan-out of raw fragments to the connected client.
//!
//! Every ingested fragment is queued here before aggregation runs. A dedicated task delivers
//! notifications in ingest order to whichever transport is attached to the conversation.
//! Failures are logged and counted, never retried, and never reach the engine.

use crate::error::RelayError;
use crate::stats::EngineStats;
use crate::types::{SpeakerRole, UtteranceKey};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Client-facing transport (e.g. a WebSocket session) for live fragment display.
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn notify_fragment(
        &self,
        conversation_id: &str,
        role: SpeakerRole,
        text: &str,
    ) -> Result<(), RelayError>;
}

struct Notification {
    key: UtteranceKey,
    text: String,
}

type TransportMap = DashMap<String, Arc<dyn LiveTransport>>;

pub struct LiveRelay {
    tx: mpsc::UnboundedSender<Notification>,
    transports: Arc<TransportMap>,
    stats: Arc<EngineStats>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LiveRelay {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn start(stats: Arc<EngineStats>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let transports: Arc<TransportMap> = Arc::new(DashMap::new());
        let worker = tokio::spawn(deliver(rx, Arc::clone(&transports), Arc::clone(&stats)));

        Self {
            tx,
            transports,
            stats,
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Associate a transport with a conversation, replacing any previous one.
    pub fn attach(&self, conversation_id: impl Into<String>, transport: Arc<dyn LiveTransport>) {
        let conversation_id = conversation_id.into();
        debug!(conversation_id = %conversation_id, "live transport attached");
        self.transports.insert(conversation_id, transport);
    }

    /// Remove the conversation's transport. Returns whether one was attached.
    pub fn detach(&self, conversation_id: &str) -> bool {
        self.transports.remove(conversation_id).is_some()
    }

    pub fn is_attached(&self, conversation_id: &str) -> bool {
        self.transports.contains_key(conversation_id)
    }

    /// Queue a fragment for display. Never blocks.
    pub fn notify(&self, key: &UtteranceKey, text: &str) {
        self.stats.record_relay_notification();
        let notification = Notification {
            key: key.clone(),
            text: text.to_string(),
        };
        if self.tx.send(notification).is_err() {
            self.stats.record_relay_failure();
            debug!(key = %key, "relay stopped; fragment not displayed");
        }
    }

    /// Stop the delivery task. Queued notifications are dropped.
    pub(crate) async fn stop(&self) {
        let worker = crate::sync::lock(&self.worker).take();
        if let Some(worker) = worker {
            worker.abort();
            let _ = worker.await;
        }
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    transports: Arc<TransportMap>,
    stats: Arc<EngineStats>,
) {
    while let Some(Notification { key, text }) = rx.recv().await {
        let transport = transports
            .get(&key.conversation_id)
            .map(|entry| Arc::clone(entry.value()));

        let Some(transport) = transport else {
            debug!(key = %key, "no live transport attached; fragment dropped");
            continue;
        };

        if let Err(e) = transport
            .notify_fragment(&key.conversation_id, key.role, &text)
            .await
        {
            stats.record_relay_failure();
            warn!(
                conversation_id = %key.conversation_id,
                role = %key.role,
                error = %e,
                "live relay delivery failed"
            );
        }
    }
}
