pub mod completion_client;
pub mod conversation;
pub mod model_selector;
pub mod relay;

pub use completion_client::{CompletionClient, CompletionProvider, UpstreamError};
pub use conversation::ConversationWindow;
pub use model_selector::{CatalogClient, CatalogProvider, ModelCatalogEntry, ModelSelector};
pub use relay::{AiReply, ChatRelay, ParticipantHandle, PostReceipt, SessionRegistry};
