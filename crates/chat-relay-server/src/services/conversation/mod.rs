//! Conversation history management
//!
//! Full history lives in the configured history store; the window derives
//! the bounded, most-recent context sent to the completion provider.

mod window;

pub use window::ConversationWindow;
