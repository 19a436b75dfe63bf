//! Conversation store boundary.
//!
//! The pipeline does not own conversation records; it only needs two
//! operations from whatever service does: look a conversation up (for
//! the `has_files_uploaded` flag and the owning user) and flip that
//! flag after a successful ingestion. The flag is monotonic — false
//! until the first successful ingestion, then true forever — so a
//! last-writer-wins update is safe under concurrent batches.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

/// The slice of a conversation record the pipeline cares about.
#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub user_id: String,
    pub has_files_uploaded: bool,
}

/// External collaborator owning conversation records.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Look up a conversation. Fails if the id is unknown.
    async fn get(&self, conversation_id: &str) -> Result<ConversationRecord>;

    /// Mark the conversation as having indexed files.
    async fn set_files_uploaded(&self, conversation_id: &str) -> Result<()>;
}

/// In-memory conversation store for tests and offline use.
pub struct InMemoryConversations {
    records: RwLock<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: ConversationRecord) {
        self.records
            .write()
            .unwrap()
            .insert(record.id.clone(), record);
    }
}

impl Default for InMemoryConversations {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversations {
    async fn get(&self, conversation_id: &str) -> Result<ConversationRecord> {
        match self.records.read().unwrap().get(conversation_id) {
            Some(record) => Ok(record.clone()),
            None => bail!("Conversation not found: {}", conversation_id),
        }
    }

    async fn set_files_uploaded(&self, conversation_id: &str) -> Result<()> {
        let mut records = self.records.write().unwrap();
        match records.get_mut(conversation_id) {
            Some(record) => {
                record.has_files_uploaded = true;
                Ok(())
            }
            None => bail!("Conversation not found: {}", conversation_id),
        }
    }
}
