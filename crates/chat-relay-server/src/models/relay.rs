use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::chat::{ConversationId, Turn, VisitorInfo};

/// Identifies one live transport connection.
pub type ConnectionId = Uuid;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    #[default]
    Visitor,
    Agent,
    Admin,
}

// ===== CLIENT -> SERVER =====

/// Frames a relay client may send. Legacy widget field names are accepted as aliases.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        #[serde(default, alias = "chat_id")]
        conversation_id: Option<ConversationId>,
        #[serde(default, alias = "user_type")]
        role: ParticipantRole,
    },
    Message {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
        #[serde(default, alias = "sender")]
        sender_role: ParticipantRole,
        #[serde(alias = "message")]
        content: String,
    },
    Leave {
        #[serde(alias = "chat_id")]
        conversation_id: ConversationId,
    },
    Ping,
}

// ===== SERVER -> CLIENT =====

/// Events delivered to relay participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    HistoryReplay {
        conversation_id: ConversationId,
        turns: Vec<Turn>,
    },
    MessageBroadcast {
        conversation_id: ConversationId,
        turn: Turn,
    },
    NewChat {
        conversation_id: ConversationId,
        visitor: VisitorInfo,
    },
    FallbackNotice {
        conversation_id: ConversationId,
        content: String,
    },
    Error {
        message: String,
    },
    Pong,
}
