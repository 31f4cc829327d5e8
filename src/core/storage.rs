//! Storage collaborator used to persist conversation history.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::AgentResult;

/// Key/value storage supplied by the host.
///
/// The engine only ever calls `get` and `set`; the medium is up to the host.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get(&self, key: &str) -> AgentResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> AgentResult<()>;
}

/// In-memory storage, handy for tests and single-process hosts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: String) -> AgentResult<()> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
