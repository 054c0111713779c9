//! History persistence.
//!
//! The relay never talks to a concrete backend; everything goes through
//! [`HistoryStore`]. Backends:
//! - [`MemoryHistoryStore`]: process memory, lazy expiry
//! - [`FileHistoryStore`]: single JSON document on local disk
//! - [`RedisHistoryStore`]: one JSON value per key with native expiry

mod file;
mod memory;
mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::models::{Conversation, ConversationId, Turn};

pub use self::file::FileHistoryStore;
pub use self::memory::MemoryHistoryStore;
pub use self::redis_store::RedisHistoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored history is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Ordered turn lists keyed by conversation id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// `Ok(None)` when the conversation is unknown or expired.
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Replace the full history. `ttl = None` keeps it forever.
    async fn set(
        &self,
        conversation_id: &str,
        turns: &[Turn],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    async fn all(&self) -> Result<HashMap<ConversationId, Vec<Turn>>, StoreError>;

    /// Drop expired conversations, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

pub(crate) fn expiry_from(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    Utc::now().checked_add_signed(ttl)
}

/// Build the configured backend.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn HistoryStore>, StoreError> {
    let store: Arc<dyn HistoryStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryHistoryStore::new()),
        StoreBackend::File => Arc::new(FileHistoryStore::new(&config.path)),
        StoreBackend::Redis => {
            Arc::new(RedisHistoryStore::connect(&config.redis_url, &config.key_prefix).await?)
        }
    };
    info!(backend = ?config.backend, "History store ready");
    Ok(store)
}
