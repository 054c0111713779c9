use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::bus::{RelayBus, Topic};
use super::registry::{ParticipantHandle, SessionRegistry};
use crate::config::{ConversationConfig, RelayConfig};
use crate::models::{
    ConnectionId, ConversationId, ParticipantRole, RelayEvent, Role, Turn, VisitorInfo,
};
use crate::services::completion_client::CompletionProvider;
use crate::services::conversation::ConversationWindow;
use crate::services::model_selector::ModelSelector;
use crate::utils::error::InputError;
use crate::utils::token_estimator::{estimate_prompt_tokens, estimate_tokens};

/// Outcome of the AI fallback for one posted message.
#[derive(Debug, Clone, PartialEq)]
pub enum AiReply {
    /// Sender was not a visitor, or policy skipped the call.
    NotTriggered,
    Answered(Turn),
    /// Upstream failed; the room got the fallback notice instead.
    Failed { fallback_message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostReceipt {
    pub turn: Turn,
    pub reply: AiReply,
}

/// Room-scoped relay between visitors, human agents and admin observers.
///
/// Each post is appended and broadcast under the conversation's sequencer so
/// room visibility order matches append order. The AI call itself runs
/// outside every lock; its answer re-enters the same append path.
pub struct ChatRelay {
    registry: Arc<SessionRegistry>,
    bus: RelayBus,
    window: Arc<ConversationWindow>,
    selector: Arc<ModelSelector>,
    completions: Arc<dyn CompletionProvider>,
    config: RelayConfig,
    max_tokens: u32,
    temperature: f32,
}

impl ChatRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        window: Arc<ConversationWindow>,
        selector: Arc<ModelSelector>,
        completions: Arc<dyn CompletionProvider>,
        config: RelayConfig,
        conversation: &ConversationConfig,
    ) -> Self {
        Self {
            bus: RelayBus::new(registry.clone()),
            registry,
            window,
            selector,
            completions,
            config,
            max_tokens: conversation.max_tokens,
            temperature: conversation.temperature,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn window(&self) -> &Arc<ConversationWindow> {
        &self.window
    }

    pub fn fallback_message(&self) -> &str {
        &self.config.fallback_message
    }

    /// Register a participant. Admins always attach to the observer stream and
    /// may also join a room; everyone else needs a conversation id.
    ///
    /// A joiner of a room with history gets one `history_replay` before any
    /// live broadcast for that room.
    pub async fn join(
        &self,
        conversation_id: Option<&str>,
        handle: &ParticipantHandle,
    ) -> Result<(), InputError> {
        let conversation_id = conversation_id.map(str::trim).filter(|id| !id.is_empty());

        if handle.role == ParticipantRole::Admin {
            self.registry.join_admin_stream(handle.clone());
            info!(connection_id = %handle.connection_id, "Admin joined");
        }

        let Some(conversation_id) = conversation_id else {
            return match handle.role {
                ParticipantRole::Admin => Ok(()),
                _ => Err(InputError::EmptyConversationId),
            };
        };

        let registry = &self.registry;
        self.window
            .with_history(conversation_id, |turns| {
                registry.join(conversation_id, handle.clone());
                if !turns.is_empty() {
                    debug!(
                        conversation_id = %conversation_id,
                        "Replaying {} turns to {}",
                        turns.len(),
                        handle.connection_id
                    );
                    handle.send(RelayEvent::HistoryReplay {
                        conversation_id: conversation_id.to_string(),
                        turns,
                    });
                }
            })
            .await;

        info!(
            conversation_id = %conversation_id,
            connection_id = %handle.connection_id,
            role = ?handle.role,
            "Participant joined chat"
        );
        Ok(())
    }

    pub fn leave_room(&self, conversation_id: &str, connection_id: ConnectionId) {
        self.registry.leave_room(conversation_id, connection_id);
    }

    /// Detach a connection from every room and the admin stream.
    /// In-flight AI calls made on its behalf keep running.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Vec<ConversationId> {
        self.registry.leave(connection_id)
    }

    /// Open a new visitor chat and announce it to admins.
    pub async fn start_chat(&self, visitor: VisitorInfo) -> ConversationId {
        let conversation_id = Uuid::new_v4().to_string();
        self.window.ensure_exists(&conversation_id).await;
        self.registry.register_visitor(&conversation_id, visitor.clone());

        self.bus.publish(
            Topic::Admin,
            &RelayEvent::NewChat {
                conversation_id: conversation_id.clone(),
                visitor,
            },
        );
        info!(conversation_id = %conversation_id, "Chat started");
        conversation_id
    }

    /// Record and broadcast a message, then run the AI fallback for visitors.
    pub async fn post(
        &self,
        conversation_id: &str,
        sender_role: ParticipantRole,
        content: &str,
        origin_address: Option<String>,
    ) -> Result<PostReceipt, InputError> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(InputError::EmptyConversationId);
        }
        if content.trim().is_empty() {
            return Err(InputError::EmptyContent);
        }

        let role = match sender_role {
            ParticipantRole::Visitor => Role::User,
            ParticipantRole::Agent | ParticipantRole::Admin => Role::Assistant,
        };
        let turn = self
            .record(conversation_id, Turn::new(role, content).with_origin(origin_address))
            .await;

        let reply = if self.should_answer(conversation_id, sender_role) {
            self.answer(conversation_id).await
        } else {
            AiReply::NotTriggered
        };

        Ok(PostReceipt { turn, reply })
    }

    fn should_answer(&self, conversation_id: &str, sender_role: ParticipantRole) -> bool {
        if sender_role != ParticipantRole::Visitor || !self.config.ai_fallback {
            return false;
        }
        if self.config.suppress_ai_when_agent_present && self.registry.has_agent(conversation_id) {
            debug!(conversation_id = %conversation_id, "Agent present, leaving reply to human");
            return false;
        }
        true
    }

    async fn answer(&self, conversation_id: &str) -> AiReply {
        let model_id = self.selector.resolve().await;
        let context = self
            .window
            .context(conversation_id, self.window.default_window())
            .await;
        let system_prompt = self.window.system_prompt();

        let result = self
            .completions
            .complete(
                &model_id,
                system_prompt,
                &context,
                self.max_tokens,
                self.temperature,
            )
            .await;

        match result {
            Ok(text) if !text.is_empty() => {
                let tokens_in = estimate_prompt_tokens(system_prompt, &context);
                let tokens_out = estimate_tokens(&text);
                let turn = Turn::assistant(text)
                    .with_model(model_id)
                    .with_token_estimates(tokens_in, tokens_out);
                AiReply::Answered(self.record(conversation_id, turn).await)
            }
            Ok(_) => {
                warn!(conversation_id = %conversation_id, model = %model_id, "Upstream returned an empty completion");
                self.notify_fallback(conversation_id)
            }
            Err(e) => {
                error!(conversation_id = %conversation_id, model = %model_id, "AI fallback failed: {}", e);
                self.notify_fallback(conversation_id)
            }
        }
    }

    /// Surface the apology to the room without persisting it.
    fn notify_fallback(&self, conversation_id: &str) -> AiReply {
        self.bus.publish(
            Topic::Room(conversation_id),
            &RelayEvent::FallbackNotice {
                conversation_id: conversation_id.to_string(),
                content: self.config.fallback_message.clone(),
            },
        );
        AiReply::Failed {
            fallback_message: self.config.fallback_message.clone(),
        }
    }

    async fn record(&self, conversation_id: &str, turn: Turn) -> Turn {
        let bus = &self.bus;
        self.window
            .append_then(conversation_id, turn, |turn| {
                let event = RelayEvent::MessageBroadcast {
                    conversation_id: conversation_id.to_string(),
                    turn: turn.clone(),
                };
                bus.publish_all(&[Topic::Room(conversation_id), Topic::Admin], &event);
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::services::completion_client::UpstreamError;
    use crate::services::model_selector::{CatalogProvider, ModelCatalogEntry};
    use crate::store::MemoryHistoryStore;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptyCatalog;

    #[async_trait::async_trait]
    impl CatalogProvider for EmptyCatalog {
        async fn fetch_catalog(&self) -> Result<Vec<ModelCatalogEntry>, UpstreamError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct ScriptedCompletions {
        fail: bool,
        calls: AtomicUsize,
        last_context: Mutex<Vec<Turn>>,
    }

    #[async_trait::async_trait]
    impl CompletionProvider for ScriptedCompletions {
        async fn complete(
            &self,
            _model_id: &str,
            _system_prompt: &str,
            context: &[Turn],
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_context.lock() = context.to_vec();
            if self.fail {
                Err(UpstreamError::Status {
                    status: 500,
                    body: "boom".to_string(),
                })
            } else {
                Ok(format!("echo: {}", context.last().map(|t| t.content.as_str()).unwrap_or("")))
            }
        }
    }

    fn relay_with(completions: Arc<ScriptedCompletions>, config: RelayConfig) -> ChatRelay {
        let conversation = ConversationConfig::default();
        let window = Arc::new(ConversationWindow::new(
            Arc::new(MemoryHistoryStore::new()),
            &conversation,
        ));
        let selector = Arc::new(ModelSelector::new(
            Arc::new(EmptyCatalog),
            &ModelConfig {
                preferred: None,
                fallback_id: "fallback-model".to_string(),
                catalog_ttl_seconds: 86_400,
                failure_backoff_seconds: 60,
            },
        ));
        ChatRelay::new(
            Arc::new(SessionRegistry::new()),
            window,
            selector,
            completions,
            config,
            &conversation,
        )
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_visitor_post_gets_ai_answer() {
        let completions = Arc::new(ScriptedCompletions::default());
        let relay = relay_with(completions.clone(), RelayConfig::default());
        let (visitor, mut rx) = ParticipantHandle::channel(ParticipantRole::Visitor);
        relay.join(Some("c1"), &visitor).await.unwrap();

        let receipt = relay
            .post("c1", ParticipantRole::Visitor, "hello", Some("1.2.3.4".to_string()))
            .await
            .unwrap();

        assert_eq!(receipt.turn.role, Role::User);
        assert_eq!(receipt.turn.origin_address.as_deref(), Some("1.2.3.4"));
        match &receipt.reply {
            AiReply::Answered(turn) => {
                assert_eq!(turn.content, "echo: hello");
                assert_eq!(turn.model_id.as_deref(), Some("fallback-model"));
                assert!(turn.token_estimate_in.is_some());
                assert!(turn.token_estimate_out.is_some());
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(relay.window().history("c1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_agent_post_does_not_call_ai() {
        let completions = Arc::new(ScriptedCompletions::default());
        let relay = relay_with(completions.clone(), RelayConfig::default());

        let receipt = relay
            .post("c1", ParticipantRole::Agent, "a human here", None)
            .await
            .unwrap();

        assert_eq!(receipt.turn.role, Role::Assistant);
        assert_eq!(receipt.reply, AiReply::NotTriggered);
        assert_eq!(completions.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ai_runs_even_with_agent_present_by_default() {
        let completions = Arc::new(ScriptedCompletions::default());
        let relay = relay_with(completions.clone(), RelayConfig::default());
        let (agent, _rx) = ParticipantHandle::channel(ParticipantRole::Agent);
        relay.join(Some("c1"), &agent).await.unwrap();

        relay.post("c1", ParticipantRole::Visitor, "hi", None).await.unwrap();
        assert_eq!(completions.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_agent_presence_suppresses_ai_when_configured() {
        let completions = Arc::new(ScriptedCompletions::default());
        let relay = relay_with(
            completions.clone(),
            RelayConfig {
                suppress_ai_when_agent_present: true,
                ..RelayConfig::default()
            },
        );
        let (agent, _rx) = ParticipantHandle::channel(ParticipantRole::Agent);
        relay.join(Some("c1"), &agent).await.unwrap();

        let receipt = relay.post("c1", ParticipantRole::Visitor, "hi", None).await.unwrap();
        assert_eq!(receipt.reply, AiReply::NotTriggered);

        relay.disconnect(agent.connection_id);
        let receipt = relay.post("c1", ParticipantRole::Visitor, "anyone?", None).await.unwrap();
        assert!(matches!(receipt.reply, AiReply::Answered(_)));
    }

    #[tokio::test]
    async fn test_empty_content_is_rejected_without_side_effects() {
        let completions = Arc::new(ScriptedCompletions::default());
        let relay = relay_with(completions.clone(), RelayConfig::default());
        let (visitor, mut rx) = ParticipantHandle::channel(ParticipantRole::Visitor);
        relay.join(Some("c1"), &visitor).await.unwrap();

        let err = relay.post("c1", ParticipantRole::Visitor, "", None).await.unwrap_err();
        assert_eq!(err, InputError::EmptyContent);
        let err = relay.post(" ", ParticipantRole::Visitor, "hi", None).await.unwrap_err();
        assert_eq!(err, InputError::EmptyConversationId);

        assert!(drain(&mut rx).is_empty());
        assert!(relay.window().history("c1").await.is_empty());
        assert_eq!(completions.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_sends_one_notice_and_persists_nothing() {
        let completions = Arc::new(ScriptedCompletions {
            fail: true,
            ..ScriptedCompletions::default()
        });
        let relay = relay_with(completions, RelayConfig::default());
        let (visitor, mut rx) = ParticipantHandle::channel(ParticipantRole::Visitor);
        relay.join(Some("c1"), &visitor).await.unwrap();

        let receipt = relay.post("c1", ParticipantRole::Visitor, "hi", None).await.unwrap();
        assert!(matches!(receipt.reply, AiReply::Failed { .. }));

        let events = drain(&mut rx);
        let notices: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, RelayEvent::FallbackNotice { .. }))
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(events.len(), 2);

        let history = relay.window().history("c1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_join_requires_room_except_for_admins() {
        let relay = relay_with(Arc::new(ScriptedCompletions::default()), RelayConfig::default());
        let (visitor, _rx) = ParticipantHandle::channel(ParticipantRole::Visitor);
        let (admin, _arx) = ParticipantHandle::channel(ParticipantRole::Admin);

        assert_eq!(
            relay.join(None, &visitor).await.unwrap_err(),
            InputError::EmptyConversationId
        );
        relay.join(None, &admin).await.unwrap();
        assert_eq!(relay.registry().admin_subscribers().len(), 1);
        assert_eq!(relay.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_start_chat_announces_to_admins() {
        let relay = relay_with(Arc::new(ScriptedCompletions::default()), RelayConfig::default());
        let (admin, mut rx) = ParticipantHandle::channel(ParticipantRole::Admin);
        relay.join(None, &admin).await.unwrap();

        let id = relay
            .start_chat(VisitorInfo::new(Some("Ana".to_string()), None))
            .await;

        assert!(relay.registry().active_chats().contains_key(&id));
        assert!(relay.window().all_conversations().await.contains_key(&id));
        match rx.try_recv().unwrap() {
            RelayEvent::NewChat { conversation_id, visitor } => {
                assert_eq!(conversation_id, id);
                assert_eq!(visitor.name, "Ana");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_context_window_bounds_upstream_turns() {
        let completions = Arc::new(ScriptedCompletions::default());
        let relay = relay_with(
            completions.clone(),
            RelayConfig {
                ai_fallback: false,
                ..RelayConfig::default()
            },
        );
        for i in 0..7 {
            relay
                .post("c1", ParticipantRole::Visitor, &format!("m{i}"), None)
                .await
                .unwrap();
        }
        assert_eq!(completions.calls.load(Ordering::SeqCst), 0);

        let relay = ChatRelay {
            config: RelayConfig::default(),
            ..relay
        };
        relay.post("c1", ParticipantRole::Visitor, "last", None).await.unwrap();

        let context = completions.last_context.lock().clone();
        assert_eq!(context.len(), 5);
        assert_eq!(context.last().unwrap().content, "last");
    }
}
