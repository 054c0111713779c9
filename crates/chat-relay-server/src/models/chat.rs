use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conversation identifier (caller supplied, UUID, or network origin).
pub type ConversationId = String;

// ===== TURN MODELS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message exchanged in a conversation. Appended, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate_in: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate_out: Option<usize>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            origin_address: None,
            model_id: None,
            token_estimate_in: None,
            token_estimate_out: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin_address = origin;
        self
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_token_estimates(mut self, tokens_in: usize, tokens_out: usize) -> Self {
        self.token_estimate_in = Some(tokens_in);
        self.token_estimate_out = Some(tokens_out);
        self
    }
}

/// Full ordered history under one id, as returned by a history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

/// Role/content pair sent to the completion provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            content: turn.content.clone(),
        }
    }
}

// ===== VISITOR MODELS =====

/// Metadata recorded when a visitor opens a chat from the widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorInfo {
    pub name: String,
    pub email: String,
    pub started_at: DateTime<Utc>,
}

impl VisitorInfo {
    pub fn new(name: Option<String>, email: Option<String>) -> Self {
        Self {
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Anonymous".to_string()),
            email: email.unwrap_or_default(),
            started_at: Utc::now(),
        }
    }
}
