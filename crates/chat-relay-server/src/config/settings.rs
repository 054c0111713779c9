use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub model: ModelConfig,
    pub conversation: ConversationConfig,
    pub relay: RelayConfig,
    pub store: StoreConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct UpstreamConfig {
    pub completion_url: String,
    pub catalog_url: String,
    pub api_key: String,
    pub completion_timeout_seconds: u64,
    pub catalog_timeout_seconds: u64,
}

// Keeps the bearer token out of logs.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("completion_url", &self.completion_url)
            .field("catalog_url", &self.catalog_url)
            .field("api_key", &"***")
            .field("completion_timeout_seconds", &self.completion_timeout_seconds)
            .field("catalog_timeout_seconds", &self.catalog_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub preferred: Option<String>,
    pub fallback_id: String,
    pub catalog_ttl_seconds: u64,
    pub failure_backoff_seconds: u64,
}

impl ModelConfig {
    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_seconds)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_seconds)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConversationConfig {
    pub system_prompt: String,
    pub window_size: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    /// 0 disables expiry.
    pub ttl_seconds: u64,
}

impl ConversationConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            window_size: 5,
            max_tokens: 200,
            temperature: 0.7,
            ttl_seconds: 86_400,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayConfig {
    pub ai_fallback: bool,
    pub suppress_ai_when_agent_present: bool,
    pub fallback_message: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ai_fallback: true,
            suppress_ai_when_agent_present: false,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Redis,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: String,
    pub redis_url: String,
    pub key_prefix: String,
    pub sweep_interval_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone)]
pub struct AdminConfig {
    pub secret: String,
}

impl std::fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminConfig").field("secret", &"***").finish()
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant for zoseco.com. Be concise and friendly.";

pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "Sorry, I'm having trouble connecting to my brain right now.";

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }

    fn builder_with_defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5000)?
            .set_default(
                "upstream.completion_url",
                "https://api.venice.ai/api/v1/chat/completions",
            )?
            .set_default("upstream.catalog_url", "https://api.venice.ai/api/v1/models")?
            .set_default("upstream.api_key", "")?
            .set_default("upstream.completion_timeout_seconds", 10)?
            .set_default("upstream.catalog_timeout_seconds", 5)?
            .set_default("model.fallback_id", "mixtral-8x7b")?
            .set_default("model.catalog_ttl_seconds", 86_400)?
            .set_default("model.failure_backoff_seconds", 60)?
            .set_default("conversation.system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("conversation.window_size", 5)?
            .set_default("conversation.max_tokens", 200)?
            .set_default("conversation.temperature", 0.7)?
            .set_default("conversation.ttl_seconds", 86_400)?
            .set_default("relay.ai_fallback", true)?
            .set_default("relay.suppress_ai_when_agent_present", false)?
            .set_default("relay.fallback_message", DEFAULT_FALLBACK_MESSAGE)?
            .set_default("store.backend", "memory")?
            .set_default("store.path", "data/chats.json")?
            .set_default("store.redis_url", "redis://127.0.0.1:6379")?
            .set_default("store.key_prefix", "chat:")?
            .set_default("store.sweep_interval_seconds", 300)?
            .set_default("admin.secret", "")?;
        Ok(builder)
    }
}
