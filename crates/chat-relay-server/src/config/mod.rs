pub mod settings;

pub use settings::{
    AdminConfig, ConversationConfig, ModelConfig, RelayConfig, ServerConfig, Settings,
    StoreBackend, StoreConfig, UpstreamConfig,
};
