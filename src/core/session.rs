//! Conversation history and session identity.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::storage::SessionStorage;
use crate::errors::AgentResult;

/// Default number of messages kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One conversational turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }
}

/// History and identity of one logical conversation.
///
/// History is bounded; once full, the oldest message is dropped on every append.
pub struct SessionContext {
    session_id: String,
    limit: usize,
    history: Mutex<VecDeque<Message>>,
    storage: Option<Arc<dyn SessionStorage>>,
}

impl SessionContext {
    pub fn new(session_id: Option<String>, limit: usize) -> Self {
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            session_id,
            limit: limit.max(1),
            history: Mutex::new(VecDeque::new()),
            storage: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn SessionStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn append_message(&self, message: Message) {
        let mut history = self.history.lock();
        history.push_back(message);
        while history.len() > self.limit {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<Message> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.lock().is_empty()
    }

    pub fn clear(&self) {
        self.history.lock().clear();
    }

    fn storage_key(&self) -> String {
        format!("waav-agent:{}:history", self.session_id)
    }

    /// Write history to storage. A no-op without storage.
    pub async fn persist(&self) -> AgentResult<()> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let snapshot = self.history();
        let json = serde_json::to_string(&snapshot)?;
        storage.set(&self.storage_key(), json).await?;
        debug!(session_id = %self.session_id, messages = snapshot.len(), "History persisted");
        Ok(())
    }

    /// Load prior history from storage, replacing what is in memory.
    ///
    /// Returns how many messages were restored.
    pub async fn restore(&self) -> AgentResult<usize> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let Some(json) = storage.get(&self.storage_key()).await? else {
            return Ok(0);
        };
        let messages: Vec<Message> = serde_json::from_str(&json)?;
        let skip = messages.len().saturating_sub(self.limit);

        let mut history = self.history.lock();
        history.clear();
        history.extend(messages.into_iter().skip(skip));
        info!(session_id = %self.session_id, messages = history.len(), "History restored");
        Ok(history.len())
    }
}

/// Result of comparing a value against the stored snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    /// Same content as the snapshot
    Unchanged,
    /// No snapshot existed yet
    First,
    /// Content differs; carries the previous snapshot
    Changed(T),
}

/// Remembers the last value seen and reports structural changes.
#[derive(Debug)]
pub struct ChangeTracker<T> {
    previous: Mutex<Option<T>>,
}

impl<T> Default for ChangeTracker<T> {
    fn default() -> Self {
        Self {
            previous: Mutex::new(None),
        }
    }
}

impl<T: Clone + PartialEq> ChangeTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `value` with the snapshot and store it if it differs.
    pub fn update(&self, value: &T) -> Change<T> {
        let mut previous = self.previous.lock();
        if previous.as_ref() == Some(value) {
            return Change::Unchanged;
        }
        match previous.replace(value.clone()) {
            Some(old) => Change::Changed(old),
            None => Change::First,
        }
    }

    pub fn current(&self) -> Option<T> {
        self.previous.lock().clone()
    }

    pub fn reset(&self) {
        *self.previous.lock() = None;
    }
}
