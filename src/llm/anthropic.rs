// Anthropic Messages API adapter
// API Reference: https://docs.anthropic.com/en/api/messages

use crate::gateway::{retry_after_header, ToolError};
use crate::llm::provider::LLMAdapter;
use crate::types::{LLMRequest, LLMResponse, TokenUsage};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
// The Messages API requires max_tokens
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicAdapter {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: ANTHROPIC_API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LLMAdapter for AnthropicAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> Result<LLMResponse, ToolError> {
        let url = format!("{}/messages", self.base_url);

        // System prompts travel outside the message list
        let system_from_messages = request
            .messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = request
            .system_instruction
            .as_deref()
            .or((!system_from_messages.is_empty()).then_some(system_from_messages.as_str()));

        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != "system")
                .map(|m| AnthropicMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::from_reqwest("anthropic", e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers());
            let error_text = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<AnthropicErrorResponse>(&error_text)
                .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
                .unwrap_or(error_text);
            return Err(ToolError::from_status("anthropic", status, &detail, retry_after));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ToolError::from_reqwest("anthropic", e))?;

        let content = parsed
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens,
                completion_tokens: u.output_tokens,
                total_tokens: u.input_tokens + u.output_tokens,
            })
            .unwrap_or_default();

        Ok(LLMResponse {
            content,
            finish_reason: parsed.stop_reason.unwrap_or_else(|| "unknown".to_string()),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ToolErrorKind;
    use crate::types::LLMMessage;

    fn request() -> LLMRequest {
        LLMRequest {
            model: "claude-sonnet-4-5".to_string(),
            messages: vec![LLMMessage::user("Is the evidence sufficient?")],
            max_tokens: None,
            temperature: Some(0.2),
            system_instruction: Some("You are a strict reviewer.".to_string()),
        }
    }

    #[tokio::test]
    async fn test_messages_request_and_text_blocks() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", ANTHROPIC_VERSION)
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "claude-sonnet-4-5",
                "max_tokens": DEFAULT_MAX_TOKENS,
                "system": "You are a strict reviewer.",
                "messages": [{"role": "user", "content": "Is the evidence sufficient?"}]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"content":[{"type":"text","text":"{\"grade\":"},{"type":"text","text":"\"pass\"}"}],
                   "stop_reason":"end_turn","usage":{"input_tokens":20,"output_tokens":5}}"#,
            )
            .create_async()
            .await;

        let adapter = AnthropicAdapter::new("test-key").with_base_url(&server.url());
        let response = adapter.create_chat_completion(&request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, r#"{"grade":"pass"}"#);
        assert_eq!(response.finish_reason, "end_turn");
        assert_eq!(response.usage.total_tokens, 25);
    }

    #[tokio::test]
    async fn test_overloaded_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/messages")
            .with_status(529)
            .with_body(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .create_async()
            .await;

        let adapter = AnthropicAdapter::new("test-key").with_base_url(&server.url());
        let err = adapter.create_chat_completion(&request()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Transient);
        assert!(err.message.contains("overloaded_error"));
    }

    #[tokio::test]
    async fn test_invalid_request_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/messages")
            .with_status(400)
            .with_body(r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad model"}}"#)
            .create_async()
            .await;

        let adapter = AnthropicAdapter::new("test-key").with_base_url(&server.url());
        let err = adapter.create_chat_completion(&request()).await.unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::Permanent);
    }
}
