pub mod chat;
pub mod relay;

pub use chat::{ChatMessage, Conversation, ConversationId, Role, Turn, VisitorInfo};
pub use relay::{ClientFrame, ConnectionId, ParticipantRole, RelayEvent};
