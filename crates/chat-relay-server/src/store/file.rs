use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{expiry_from, HistoryStore, StoreError};
use crate::models::{Conversation, ConversationId, Turn};

/// History kept in one JSON document on local disk.
///
/// Every write rewrites the whole document through a temp file and a rename,
/// so readers never observe a half-written file.
pub struct FileHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type Document = BTreeMap<ConversationId, Conversation>;

impl FileHistoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!("Using file history store at {}", path.display());
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Document, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Document::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &Document) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(document)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Wrote {} conversations to {}", document.len(), self.path.display());
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for FileHistoryStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        let _guard = self.lock.lock().await;
        let document = self.load().await?;
        Ok(document
            .get(conversation_id)
            .filter(|conversation| !conversation.is_expired())
            .cloned())
    }

    async fn set(
        &self,
        conversation_id: &str,
        turns: &[Turn],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        document.retain(|_, conversation| !conversation.is_expired());
        document.insert(
            conversation_id.to_string(),
            Conversation {
                id: conversation_id.to_string(),
                turns: turns.to_vec(),
                expires_at: expiry_from(ttl),
            },
        );
        self.save(&document).await
    }

    async fn all(&self) -> Result<HashMap<ConversationId, Vec<Turn>>, StoreError> {
        let _guard = self.lock.lock().await;
        let document = self.load().await?;
        Ok(document
            .into_iter()
            .filter(|(_, conversation)| !conversation.is_expired())
            .map(|(id, conversation)| (id, conversation.turns))
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let before = document.len();
        document.retain(|_, conversation| !conversation.is_expired());
        let removed = before - document.len();
        if removed > 0 {
            self.save(&document).await?;
            info!("Cleaned up {} expired conversations", removed);
        }
        Ok(removed)
    }
}
