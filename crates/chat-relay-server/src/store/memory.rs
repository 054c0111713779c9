use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{expiry_from, HistoryStore, StoreError};
use crate::models::{Conversation, ConversationId, Turn};

/// Thread-safe in-memory history store
/// Uses DashMap for sharded concurrent access
#[derive(Clone, Default)]
pub struct MemoryHistoryStore {
    storage: Arc<DashMap<ConversationId, Conversation>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        info!("Initializing in-memory history store");
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Removes the entry only if it is still expired under the shard lock,
    /// so a history written since the caller's read survives.
    fn evict_if_expired(&self, conversation_id: &str) -> bool {
        let removed = self
            .storage
            .remove_if(conversation_id, |_, conversation| conversation.is_expired())
            .is_some();
        if removed {
            debug!("Conversation {} expired, removed from store", conversation_id);
        }
        removed
    }

    /// Returns number of conversations removed
    pub fn cleanup_expired(&self) -> usize {
        let start_len = self.storage.len();
        self.storage.retain(|_, conversation| !conversation.is_expired());
        let count = start_len.saturating_sub(self.storage.len());

        if count > 0 {
            info!("Cleaned up {} expired conversations", count);
        }

        count
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        let Some(entry) = self.storage.get(conversation_id) else {
            return Ok(None);
        };
        let conversation = entry.value().clone();

        // Lazy deletion
        if conversation.is_expired() {
            drop(entry);
            self.evict_if_expired(conversation_id);
            return Ok(None);
        }

        Ok(Some(conversation))
    }

    async fn set(
        &self,
        conversation_id: &str,
        turns: &[Turn],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.storage.insert(
            conversation_id.to_string(),
            Conversation {
                id: conversation_id.to_string(),
                turns: turns.to_vec(),
                expires_at: expiry_from(ttl),
            },
        );
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<ConversationId, Vec<Turn>>, StoreError> {
        Ok(self
            .storage
            .iter()
            .filter(|entry| !entry.value().is_expired())
            .map(|entry| (entry.key().clone(), entry.value().turns.clone()))
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.cleanup_expired())
    }
}
