//! **Persistence Gateway** - durable storage for finalized utterances.
//!
//! Implement `PersistenceGateway` for the conversation store. Two stores ship with the crate:
//! `InMemoryMessageStore` for tests and embedding, and `JsonlMessageStore`, which appends one
//! JSON line per message to `<root>/<conversation>.jsonl`.

use crate::error::{PersistError, ScribeResult};
use crate::sync::lock;
use crate::types::{FinalizedUtterance, MessageId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Durable store for one finalized utterance at a time.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Store the utterance as a conversation message. Return `PersistError::Transient` for
    /// conditions worth retrying and `PersistError::Permanent` otherwise.
    async fn persist_message(&self, utterance: &FinalizedUtterance) -> Result<MessageId, PersistError>;
}

/// A stored conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    #[serde(flatten)]
    pub utterance: FinalizedUtterance,
}

/// Rejects utterances no store can accept.
fn check_well_formed(utterance: &FinalizedUtterance) -> Result<(), PersistError> {
    if utterance.conversation_id.trim().is_empty() {
        return Err(PersistError::Permanent(
            "utterance has an empty conversation id".to_string(),
        ));
    }
    Ok(())
}

/// Keeps messages in memory, in persistence order.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored messages in the order they were persisted.
    pub fn messages(&self) -> Vec<StoredMessage> {
        lock(&self.messages).clone()
    }

    pub fn messages_for(&self, conversation_id: &str) -> Vec<StoredMessage> {
        lock(&self.messages)
            .iter()
            .filter(|m| m.utterance.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryMessageStore {
    async fn persist_message(&self, utterance: &FinalizedUtterance) -> Result<MessageId, PersistError> {
        check_well_formed(utterance)?;
        let id = MessageId::generate();
        lock(&self.messages).push(StoredMessage {
            id: id.clone(),
            utterance: utterance.clone(),
        });
        Ok(id)
    }
}

/// Appends messages to one JSON-lines file per conversation.
#[derive(Debug)]
pub struct JsonlMessageStore {
    root: PathBuf,
    // Roles of one conversation persist on different lanes; serialize appends per file.
    file_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl JsonlMessageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding a conversation's messages.
    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        let slug: String = conversation_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{}.jsonl", slug))
    }

    /// Read back a conversation's messages. A conversation with no file has no messages.
    pub async fn load(&self, conversation_id: &str) -> ScribeResult<Vec<StoredMessage>> {
        let path = self.path_for(conversation_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect()
    }

    fn file_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let entry = self
            .file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        Arc::clone(entry.value())
    }
}

#[async_trait]
impl PersistenceGateway for JsonlMessageStore {
    async fn persist_message(&self, utterance: &FinalizedUtterance) -> Result<MessageId, PersistError> {
        check_well_formed(utterance)?;

        let message = StoredMessage {
            id: MessageId::generate(),
            utterance: utterance.clone(),
        };
        let mut line = serde_json::to_string(&message)
            .map_err(|e| PersistError::Permanent(format!("serialize message: {}", e)))?;
        line.push('\n');

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PersistError::Transient(format!("create {}: {}", self.root.display(), e)))?;

        let path = self.path_for(&utterance.conversation_id);
        let file_lock = self.file_lock(&path);
        let _guard = file_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PersistError::Transient(format!("open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PersistError::Transient(format!("write {}: {}", path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| PersistError::Transient(format!("flush {}: {}", path.display(), e)))?;

        debug!(
            message_id = %message.id,
            path = %path.display(),
            "message appended"
        );
        Ok(message.id)
    }
}
