use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::models::{ChatMessage, Role, Turn};

/// Failure talking to the upstream provider. Never retried here.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("failed to reach upstream: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed upstream response: {0}")]
    MalformedBody(String),

    #[error("upstream returned no completion")]
    EmptyChoices,
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_decode() {
            UpstreamError::MalformedBody(e.to_string())
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

/// Seam for anything that can answer a chat completion.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(
        &self,
        model_id: &str,
        system_prompt: &str,
        context: &[Turn],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, UpstreamError>;
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Option<Vec<Choice>>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Synchronous (non-streaming) chat-completion client.
#[derive(Clone)]
pub struct CompletionClient {
    client: Client,
    url: String,
    api_key: String,
}

impl CompletionClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.completion_timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            url: config.completion_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn build_messages(system_prompt: &str, context: &[Turn]) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage {
            role: Role::System,
            content: system_prompt.to_string(),
        })
        .chain(context.iter().map(ChatMessage::from))
        .collect()
    }
}

#[async_trait::async_trait]
impl CompletionProvider for CompletionClient {
    async fn complete(
        &self,
        model_id: &str,
        system_prompt: &str,
        context: &[Turn],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, UpstreamError> {
        debug!(model = %model_id, "Requesting completion with {} context turns", context.len());

        let request = ChatCompletionRequest {
            model: model_id,
            messages: Self::build_messages(system_prompt, context),
            max_tokens,
            temperature,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::MalformedBody(e.to_string()))?;

        let first = parsed
            .choices
            .and_then(|choices| choices.into_iter().next())
            .ok_or(UpstreamError::EmptyChoices)?;

        first
            .message
            .and_then(|m| m.content)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| UpstreamError::MalformedBody("choice has no message content".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer, timeout_seconds: u64) -> CompletionClient {
        CompletionClient::new(&UpstreamConfig {
            completion_url: format!("{}/v1/chat/completions", server.uri()),
            catalog_url: format!("{}/v1/models", server.uri()),
            api_key: "test-key".to_string(),
            completion_timeout_seconds: timeout_seconds,
            catalog_timeout_seconds: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_sends_system_then_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(bearer_token("test-key"))
            .and(body_partial_json(json!({
                "model": "mixtral-8x7b",
                "max_tokens": 200,
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hello"},
                    {"role": "assistant", "content": "hi"},
                    {"role": "user", "content": "how are you?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "  Fine, thanks!\n"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let context = vec![
            Turn::user("hello"),
            Turn::assistant("hi"),
            Turn::user("how are you?"),
        ];
        let reply = client_for(&server, 10)
            .complete("mixtral-8x7b", "be brief", &context, 200, 0.7)
            .await
            .unwrap();

        assert_eq!(reply, "Fine, thanks!");
    }

    #[tokio::test]
    async fn test_non_success_status_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = client_for(&server, 10)
            .complete("m", "sys", &[Turn::user("hi")], 50, 0.7)
            .await
            .unwrap_err();

        match err {
            UpstreamError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "rate limited");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "nope"})))
            .mount(&server)
            .await;

        let err = client_for(&server, 10)
            .complete("m", "sys", &[], 50, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::EmptyChoices));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server, 10)
            .complete("m", "sys", &[], 50, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::MalformedBody(_)));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(3))
                    .set_body_json(json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server, 1)
            .complete("m", "sys", &[], 50, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout));
    }

    #[test]
    fn test_build_messages_prefixes_system_prompt() {
        let messages = CompletionClient::build_messages("sys", &[Turn::user("q")]);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "q");
    }
}
