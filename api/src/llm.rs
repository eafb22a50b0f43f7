//! OpenAI-compatible chat completions client backing the engine's `ChatModel`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shepherd_core::error::LlmError;
use shepherd_core::llm::{ChatModel, ChatRequest};
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: Option<Url>,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl OpenAiChatModel {
    /// Reads `OPENAI_API_KEY` and `SHEPHERD_LLM_BASE_URL`. A missing key is
    /// not fatal: every call fails with `NotConfigured` and the engine falls
    /// back to its safe reply.
    pub fn from_env(timeout: Duration) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        if api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY is not set; chat turns will use the safe reply");
        }
        let base_url =
            std::env::var("SHEPHERD_LLM_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::new(&base_url, api_key, timeout)
    }

    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let endpoint = completions_endpoint(base_url);
        if endpoint.is_none() {
            tracing::warn!(base_url = %base_url, "invalid SHEPHERD_LLM_BASE_URL");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint,
            api_key,
            timeout_secs: timeout.as_secs(),
        }
    }
}

fn completions_endpoint(base_url: &str) -> Option<Url> {
    let trimmed = base_url.trim().trim_end_matches('/');
    Url::parse(&format!("{trimmed}/")).ok()?.join("chat/completions").ok()
}

fn request_body(request: &ChatRequest) -> CompletionRequest<'_> {
    CompletionRequest {
        model: &request.model,
        messages: request
            .messages
            .iter()
            .map(|message| WireMessage {
                role: message.role.as_str(),
                content: &message.content,
            })
            .collect(),
        temperature: request.temperature,
        response_format: request.json_mode.then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}

impl ChatModel for OpenAiChatModel {
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let Some(api_key) = &self.api_key else {
            return Err(LlmError::NotConfigured("OPENAI_API_KEY is not set".to_string()));
        };
        let Some(endpoint) = &self.endpoint else {
            return Err(LlmError::NotConfigured("SHEPHERD_LLM_BASE_URL is invalid".to_string()));
        };

        let response = self
            .client
            .post(endpoint.clone())
            .bearer_auth(api_key)
            .json(&request_body(request))
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(model = %request.model, timeout = err.is_timeout(), "llm request failed");
                if err.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::Transport(err.without_url().to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(model = %request.model, status = status.as_u16(), "llm request rejected");
            return Err(LlmError::Status {
                status: status.as_u16(),
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(|err| {
            tracing::warn!(model = %request.model, "llm response could not be decoded");
            LlmError::Transport(err.without_url().to_string())
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyReply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::llm::ChatMessage;

    #[test]
    fn endpoint_joins_base_url() {
        assert_eq!(
            completions_endpoint("https://api.openai.com/v1").unwrap().as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            completions_endpoint("http://localhost:8080/v1/").unwrap().as_str(),
            "http://localhost:8080/v1/chat/completions"
        );
        assert!(completions_endpoint("not a url").is_none());
    }

    #[test]
    fn json_mode_sets_response_format() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::system("policy"), ChatMessage::user("hi")],
            temperature: 0.2,
            json_mode: true,
        };
        let body = serde_json::to_value(request_body(&request)).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");

        let prose = ChatRequest {
            json_mode: false,
            ..request
        };
        let body = serde_json::to_value(request_body(&prose)).unwrap();
        assert!(body.get("response_format").is_none());
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let model = OpenAiChatModel::new(DEFAULT_BASE_URL, None, Duration::from_secs(1));
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: 0.2,
            json_mode: false,
        };
        assert!(matches!(model.chat(&request).await, Err(LlmError::NotConfigured(_))));
    }
}
