use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ConversationConfig;
use crate::models::{ConversationId, Turn};
use crate::store::HistoryStore;

/// Full-history view over the store plus the bounded context sent upstream.
///
/// Appends to one conversation are serialized through a per-conversation
/// async lock. The lock covers the store round trip and the caller's
/// `on_appended` hook, so whatever the hook publishes is seen in append order.
pub struct ConversationWindow {
    store: Arc<dyn HistoryStore>,
    system_prompt: String,
    default_window: usize,
    ttl: Option<Duration>,
    sequencers: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl ConversationWindow {
    pub fn new(store: Arc<dyn HistoryStore>, config: &ConversationConfig) -> Self {
        Self {
            store,
            system_prompt: config.system_prompt.clone(),
            default_window: config.window_size,
            ttl: config.ttl(),
            sequencers: DashMap::new(),
        }
    }

    /// Fixed instruction that implicitly prefixes every context.
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn default_window(&self) -> usize {
        self.default_window
    }

    pub async fn append(&self, conversation_id: &str, turn: Turn) -> Turn {
        self.append_then(conversation_id, turn, |_| {}).await
    }

    /// Append `turn`, persist the full history, then run `on_appended` while
    /// the conversation is still locked. Returns the turn as recorded.
    ///
    /// A store failure never fails the append: the turn is still broadcast
    /// and returned. When the existing history cannot be read the write is
    /// skipped, since the full list to store is unknown.
    pub async fn append_then<F>(&self, conversation_id: &str, mut turn: Turn, on_appended: F) -> Turn
    where
        F: FnOnce(&Turn),
    {
        let sequencer = self.sequencer(conversation_id);
        let guard = sequencer.lock().await;

        match self.store.get(conversation_id).await {
            Ok(existing) => {
                let mut turns = existing.map(|c| c.turns).unwrap_or_default();
                if let Some(last) = turns.last() {
                    // keep timestamps nondecreasing even if the clock stepped back
                    if turn.timestamp < last.timestamp {
                        turn.timestamp = last.timestamp;
                    }
                }
                turns.push(turn.clone());

                if let Err(e) = self.store.set(conversation_id, &turns, self.ttl).await {
                    warn!(
                        conversation_id = %conversation_id,
                        "Failed to persist history ({} turns): {}",
                        turns.len(),
                        e
                    );
                }
                debug!(conversation_id = %conversation_id, turns = turns.len(), "Appended turn");
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    "Failed to read history, turn not persisted: {}",
                    e
                );
            }
        }

        on_appended(&turn);

        drop(guard);
        self.release(conversation_id, sequencer);
        turn
    }

    /// Read the full history while appends are held off, handing it to `f`.
    pub async fn with_history<F, R>(&self, conversation_id: &str, f: F) -> R
    where
        F: FnOnce(Vec<Turn>) -> R,
    {
        let sequencer = self.sequencer(conversation_id);
        let guard = sequencer.lock().await;
        let result = f(self.load(conversation_id).await);
        drop(guard);
        self.release(conversation_id, sequencer);
        result
    }

    /// Most recent `window_size` turns in original order (all of them when fewer exist).
    pub async fn context(&self, conversation_id: &str, window_size: usize) -> Vec<Turn> {
        let turns = self.load(conversation_id).await;
        let start = turns.len().saturating_sub(window_size);
        turns[start..].to_vec()
    }

    pub async fn history(&self, conversation_id: &str) -> Vec<Turn> {
        self.load(conversation_id).await
    }

    /// Every stored conversation, for the admin export.
    pub async fn all_conversations(&self) -> HashMap<ConversationId, Vec<Turn>> {
        match self.store.all().await {
            Ok(all) => all,
            Err(e) => {
                warn!("Failed to read all conversations: {}", e);
                HashMap::new()
            }
        }
    }

    /// Create an empty history if none exists yet.
    pub async fn ensure_exists(&self, conversation_id: &str) {
        let sequencer = self.sequencer(conversation_id);
        let guard = sequencer.lock().await;
        match self.store.get(conversation_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.store.set(conversation_id, &[], self.ttl).await {
                    warn!(conversation_id = %conversation_id, "Failed to create history: {}", e);
                }
            }
            Err(e) => warn!(conversation_id = %conversation_id, "Failed to read history: {}", e),
        }
        drop(guard);
        self.release(conversation_id, sequencer);
    }

    async fn load(&self, conversation_id: &str) -> Vec<Turn> {
        match self.store.get(conversation_id).await {
            Ok(Some(conversation)) => conversation.turns,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    "Failed to read history, treating as empty: {}",
                    e
                );
                Vec::new()
            }
        }
    }

    fn sequencer(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.sequencers
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    fn release(&self, conversation_id: &str, sequencer: Arc<Mutex<()>>) {
        drop(sequencer);
        // Only the map holds it now; nobody can clone it while the shard is locked.
        self.sequencers
            .remove_if(conversation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, Role};
    use crate::store::{MemoryHistoryStore, MockHistoryStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(window_size: usize) -> ConversationConfig {
        ConversationConfig {
            window_size,
            ..ConversationConfig::default()
        }
    }

    fn window() -> ConversationWindow {
        ConversationWindow::new(Arc::new(MemoryHistoryStore::new()), &config(5))
    }

    #[tokio::test]
    async fn test_context_returns_most_recent_in_order() {
        let window = window();
        for i in 0..8 {
            window.append("c1", Turn::user(format!("m{i}"))).await;
        }

        let context = window.context("c1", 5).await;
        let contents: Vec<_> = context.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5", "m6", "m7"]);

        // Full history is retained
        assert_eq!(window.history("c1").await.len(), 8);
    }

    #[tokio::test]
    async fn test_context_smaller_than_window_returns_all() {
        let window = window();
        window.append("c1", Turn::user("a")).await;
        window.append("c1", Turn::assistant("b")).await;

        let context = window.context("c1", 5).await;
        assert_eq!(context.len(), 2);
        assert_eq!(context[0].role, Role::User);
        assert!(window.context("unknown", 5).await.is_empty());
    }

    #[tokio::test]
    async fn test_append_keeps_timestamps_nondecreasing() {
        let window = window();
        let first = window.append("c1", Turn::user("first")).await;

        let mut stale = Turn::user("second");
        stale.timestamp = first.timestamp - chrono::Duration::seconds(30);
        let recorded = window.append("c1", stale).await;

        assert_eq!(recorded.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_every_turn() {
        let window = Arc::new(window());
        let mut handles = Vec::new();
        for i in 0..20 {
            let window = window.clone();
            handles.push(tokio::spawn(async move {
                window.append("c1", Turn::user(format!("m{i}"))).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(window.history("c1").await.len(), 20);
        assert!(window.sequencers.is_empty());
    }

    #[tokio::test]
    async fn test_store_read_failure_is_empty_history() {
        let mut store = MockHistoryStore::new();
        store
            .expect_get()
            .returning(|_| Err(StoreError::Unavailable("connection refused".to_string())));
        store.expect_set().times(0);

        let window = ConversationWindow::new(Arc::new(store), &config(5));
        assert!(window.context("c1", 5).await.is_empty());

        let mut seen = false;
        let turn = window
            .append_then("c1", Turn::user("still works"), |_| seen = true)
            .await;
        assert_eq!(turn.content, "still works");
        assert!(seen);
    }

    /// Memory store whose next `get` fails once.
    struct FlakyReads {
        inner: MemoryHistoryStore,
        fail_next_get: AtomicBool,
    }

    #[async_trait::async_trait]
    impl HistoryStore for FlakyReads {
        async fn get(&self, conversation_id: &str) -> Result<Option<Conversation>, StoreError> {
            if self.fail_next_get.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("timeout".to_string()));
            }
            self.inner.get(conversation_id).await
        }

        async fn set(
            &self,
            conversation_id: &str,
            turns: &[Turn],
            ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            self.inner.set(conversation_id, turns, ttl).await
        }

        async fn all(&self) -> Result<HashMap<ConversationId, Vec<Turn>>, StoreError> {
            self.inner.all().await
        }
    }

    #[tokio::test]
    async fn test_transient_read_failure_keeps_stored_history() {
        let store = Arc::new(FlakyReads {
            inner: MemoryHistoryStore::new(),
            fail_next_get: AtomicBool::new(false),
        });
        let window = ConversationWindow::new(store.clone(), &config(5));
        for i in 0..4 {
            window.append("c1", Turn::user(format!("m{i}"))).await;
        }

        store.fail_next_get.store(true, Ordering::SeqCst);
        let lost = window.append("c1", Turn::user("during outage")).await;
        assert_eq!(lost.content, "during outage");
        assert_eq!(window.history("c1").await.len(), 4);

        window.append("c1", Turn::user("after")).await;
        let history = window.history("c1").await;
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].content, "m0");
        assert_eq!(history[4].content, "after");
    }

    #[tokio::test]
    async fn test_store_write_failure_still_returns_turn() {
        let mut store = MockHistoryStore::new();
        store.expect_get().returning(|id| {
            Ok(Some(Conversation {
                id: id.to_string(),
                turns: vec![Turn::user("earlier")],
                expires_at: None,
            }))
        });
        store
            .expect_set()
            .times(1)
            .withf(|_, turns, _| turns.len() == 2)
            .returning(|_, _, _| Err(StoreError::Unavailable("read only".to_string())));

        let window = ConversationWindow::new(Arc::new(store), &config(5));
        let mut seen = None;
        let turn = window
            .append_then("c1", Turn::user("now"), |t| seen = Some(t.content.clone()))
            .await;

        assert_eq!(turn.content, "now");
        assert_eq!(seen.as_deref(), Some("now"));
    }

    #[tokio::test]
    async fn test_append_writes_with_configured_ttl() {
        let mut store = MockHistoryStore::new();
        store.expect_get().returning(|_| Ok(None));
        store
            .expect_set()
            .withf(|_, _, ttl| *ttl == Some(Duration::from_secs(86_400)))
            .returning(|_, _, _| Ok(()));

        let window = ConversationWindow::new(Arc::new(store), &config(5));
        window.append("c1", Turn::user("hi")).await;
    }
}
