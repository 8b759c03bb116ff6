use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::LLMConfig;
use crate::gateway::ToolError;
use crate::types::{AppResult, LLMMessage, LLMProvider, LLMRequest, LLMResponse};

/// Which configured model serves a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Query planning.
    Worker,
    /// Sufficiency critique and report composition.
    Critic,
}

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> Result<LLMResponse, ToolError>;
}

/// The completion capability consumed by the Tool Gateway:
/// `complete(prompt, context) -> text`, with `context` sent as the system
/// instruction.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, role: ModelRole, prompt: &str, context: &str) -> Result<String, ToolError>;
}

pub struct LLM {
    adapter: Box<dyn LLMAdapter>,
    worker_model: String,
    critic_model: String,
    max_tokens: u32,
}

impl LLM {
    pub fn from_config(config: &LLMConfig) -> AppResult<Self> {
        let provider: LLMProvider = config.provider.parse()?;

        let adapter: Box<dyn LLMAdapter> = if !config.has_api_key() {
            warn!(%provider, "No LLM API key configured, completions will fail");
            Box::new(UnconfiguredAdapter { provider })
        } else {
            match provider {
                LLMProvider::Anthropic => {
                    let mut adapter = crate::llm::anthropic::AnthropicAdapter::new(&config.api_key);
                    if let Some(base_url) = &config.base_url {
                        adapter = adapter.with_base_url(base_url);
                    }
                    Box::new(adapter)
                }
                other => {
                    let mut adapter = crate::llm::openai::OpenAIAdapter::for_provider(other, &config.api_key);
                    if let Some(base_url) = &config.base_url {
                        adapter = adapter.with_base_url(base_url);
                    }
                    Box::new(adapter)
                }
            }
        };

        info!(
            %provider,
            worker_model = %config.worker_model,
            critic_model = %config.critic_model,
            "LLM provider configured"
        );

        Ok(Self {
            adapter,
            worker_model: config.worker_model.clone(),
            critic_model: config.critic_model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    pub fn with_adapter(adapter: Box<dyn LLMAdapter>, worker_model: &str, critic_model: &str) -> Self {
        Self {
            adapter,
            worker_model: worker_model.to_string(),
            critic_model: critic_model.to_string(),
            max_tokens: 4096,
        }
    }

    pub fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Worker => &self.worker_model,
            ModelRole::Critic => &self.critic_model,
        }
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> Result<LLMResponse, ToolError> {
        self.adapter.create_chat_completion(request).await
    }
}

#[async_trait]
impl CompletionProvider for LLM {
    async fn complete(&self, role: ModelRole, prompt: &str, context: &str) -> Result<String, ToolError> {
        let request = LLMRequest {
            model: self.model_for(role).to_string(),
            messages: vec![LLMMessage::user(prompt)],
            max_tokens: Some(self.max_tokens),
            // Lower temperature for judging than for query generation
            temperature: Some(match role {
                ModelRole::Worker => 0.4,
                ModelRole::Critic => 0.2,
            }),
            system_instruction: (!context.trim().is_empty()).then(|| context.to_string()),
        };

        let response = self.create_chat_completion(&request).await?;
        if response.content.trim().is_empty() {
            return Err(ToolError::transient(format!(
                "model {} returned an empty completion (finish_reason: {})",
                request.model, response.finish_reason
            )));
        }
        Ok(response.content)
    }
}

/// Stand-in used when no API key is configured; every call fails permanently.
struct UnconfiguredAdapter {
    provider: LLMProvider,
}

#[async_trait]
impl LLMAdapter for UnconfiguredAdapter {
    async fn create_chat_completion(&self, _request: &LLMRequest) -> Result<LLMResponse, ToolError> {
        Err(ToolError::permanent(format!(
            "no API key configured for provider {}",
            self.provider
        )))
    }
}
