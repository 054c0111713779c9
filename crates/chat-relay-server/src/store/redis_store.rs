use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::{HistoryStore, StoreError};
use crate::models::{Conversation, ConversationId, Turn};

/// History kept in Redis as one JSON list per key, expired by Redis itself.
#[derive(Clone)]
pub struct RedisHistoryStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisHistoryStore {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to redis history store (prefix {:?})", key_prefix);
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn key(&self, conversation_id: &str) -> String {
        storage_key(&self.key_prefix, conversation_id)
    }
}

fn storage_key(prefix: &str, conversation_id: &str) -> String {
    format!("{prefix}{conversation_id}")
}

/// Inverse of [`storage_key`]; keys outside the prefix are returned whole.
fn conversation_id_of<'a>(prefix: &str, key: &'a str) -> &'a str {
    key.strip_prefix(prefix).unwrap_or(key)
}

#[async_trait]
impl HistoryStore for RedisHistoryStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(conversation_id);

        let raw: Option<String> = conn.get(&key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let turns: Vec<Turn> = serde_json::from_str(&raw)?;

        // -1 = no expiry, -2 = gone between the two calls
        let ttl: i64 = conn.ttl(&key).await?;
        let expires_at = (ttl > 0).then(|| Utc::now() + chrono::Duration::seconds(ttl));

        Ok(Some(Conversation {
            id: conversation_id.to_string(),
            turns,
            expires_at,
        }))
    }

    async fn set(
        &self,
        conversation_id: &str,
        turns: &[Turn],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(conversation_id);
        let payload = serde_json::to_string(turns)?;

        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(&key, payload, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(&key, payload).await?;
            }
        }
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<ConversationId, Vec<Turn>>, StoreError> {
        let mut conn = self.conn.clone();
        // KEYS is O(n); acceptable for the admin export this backs
        let keys: Vec<String> = conn.keys(format!("{}*", self.key_prefix)).await?;

        let mut chats = HashMap::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else { continue };
            let id = conversation_id_of(&self.key_prefix, &key).to_string();
            match serde_json::from_str::<Vec<Turn>>(&raw) {
                Ok(turns) => {
                    chats.insert(id, turns);
                }
                Err(e) => warn!(conversation_id = %id, "Skipping unreadable history: {}", e),
            }
        }
        Ok(chats)
    }
}
