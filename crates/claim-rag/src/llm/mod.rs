//! Chat-completion access for routing, reranking and the answering tools.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub mod simple_external;

pub use simple_external::SimpleExternalProvider;

const DEFAULT_SYSTEM_PROMPT: &str = "You assist insurance claim handlers. Work only from the \
material supplied in each request and never invent amounts or dates.";

/// LLM operation mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LLMMode {
    External {
        provider: ApiProvider,
        #[serde(default, skip_serializing)]
        api_key: String,
        model: String,
    },
    /// Routing falls back to keywords, reranking keeps fused order and the text tools fail.
    Disabled,
}

/// Hosted or self-hosted chat-completion services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ApiProvider {
    OpenAI,
    Anthropic,
    OpenRouter,
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` URL.
    Custom { endpoint: String },
}

/// Request/response shape spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    ChatCompletions,
    AnthropicMessages,
}

impl ApiProvider {
    pub fn endpoint(&self) -> String {
        match self {
            Self::OpenAI => "https://api.openai.com/v1/chat/completions".into(),
            Self::Anthropic => "https://api.anthropic.com/v1/messages".into(),
            Self::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".into(),
            Self::Ollama => "http://localhost:11434/v1/chat/completions".into(),
            Self::Custom { endpoint } => endpoint.clone(),
        }
    }

    pub fn wire_format(&self) -> WireFormat {
        match self {
            Self::Anthropic => WireFormat::AnthropicMessages,
            _ => WireFormat::ChatCompletions,
        }
    }

    /// Self-hosted endpoints run without credentials.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama | Self::Custom { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LLMConfig {
    pub mode: LLMMode,
    /// Default completion budget; callers usually pass their own.
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: String,
    /// HTTP ceiling per request. Pipeline stages apply their own, shorter timeouts.
    pub request_timeout_secs: u64,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            mode: LLMMode::Disabled,
            max_tokens: 1024,
            temperature: 0.0,
            top_p: 1.0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String>;

    fn info(&self) -> ProviderInfo;
}

/// Per-call generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub system_prompt: String,
}

impl From<&LLMConfig> for GenerationConfig {
    fn from(config: &LLMConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub model: String,
    pub is_local: bool,
}

/// Shared handle onto the configured provider. `None` provider means LLM features are off.
pub struct LLMManager {
    config: LLMConfig,
    provider: Option<Box<dyn LLMProvider>>,
}

impl LLMManager {
    pub fn new(config: LLMConfig) -> Self {
        Self {
            config,
            provider: None,
        }
    }

    pub fn with_provider(config: LLMConfig, provider: Box<dyn LLMProvider>) -> Self {
        Self {
            config,
            provider: Some(provider),
        }
    }

    /// Build the provider described by `config.mode`.
    pub async fn initialize(&mut self) -> Result<()> {
        self.provider = match &self.config.mode {
            LLMMode::External {
                provider,
                api_key,
                model,
            } => {
                let client: Box<dyn LLMProvider> = Box::new(SimpleExternalProvider::new(
                    provider.clone(),
                    api_key.clone(),
                    model.clone(),
                    self.config.request_timeout_secs,
                )?);
                Some(client)
            }
            LLMMode::Disabled => {
                tracing::info!("LLM disabled, keyword routing and fused ordering only");
                None
            }
        };
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_custom(prompt, self.config.max_tokens).await
    }

    /// Generate with an explicit output token budget.
    pub async fn generate_custom(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let provider = self
            .provider
            .as_ref()
            .ok_or_else(|| anyhow!("LLM is disabled or not initialized"))?;
        let mut config = GenerationConfig::from(&self.config);
        config.max_tokens = max_tokens;

        let start = Instant::now();
        let result = provider.generate(prompt, &config).await;
        tracing::debug!(
            prompt_chars = prompt.len(),
            max_tokens,
            ok = result.is_ok(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "LLM call finished"
        );
        result
    }

    pub fn info(&self) -> Option<ProviderInfo> {
        self.provider.as_ref().map(|p| p.info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedLlm;

    #[test]
    fn test_llm_config_default() {
        let config = LLMConfig::default();
        assert!(matches!(config.mode, LLMMode::Disabled));
        assert_eq!(config.max_tokens, 1024);
        assert!(config.system_prompt.contains("insurance claim"));
    }

    #[test]
    fn test_provider_wire_formats() {
        assert_eq!(ApiProvider::Anthropic.wire_format(), WireFormat::AnthropicMessages);
        assert_eq!(ApiProvider::Ollama.wire_format(), WireFormat::ChatCompletions);
        assert!(ApiProvider::OpenRouter.requires_api_key());
        assert!(!ApiProvider::Custom { endpoint: "http://x".into() }.requires_api_key());
    }

    #[tokio::test]
    async fn test_disabled_manager_refuses_generation() {
        let mut manager = LLMManager::new(LLMConfig::default());
        manager.initialize().await.unwrap();
        assert!(!manager.is_enabled());
        assert!(manager.info().is_none());
        let err = manager.generate("hello").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_manager_forwards_prompt() {
        let llm = ScriptedLlm::new().reply_when("hello", "hi there");
        let prompts = llm.prompts();
        let manager = LLMManager::with_provider(LLMConfig::default(), Box::new(llm));
        assert_eq!(manager.generate_custom("hello", 8).await.unwrap(), "hi there");
        assert_eq!(*prompts.lock(), vec!["hello".to_string()]);
        assert_eq!(manager.info().unwrap().name, "scripted");
    }
}
