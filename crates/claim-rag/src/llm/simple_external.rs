//! HTTP chat-completion client for OpenAI-compatible and Anthropic endpoints.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ApiProvider, GenerationConfig, LLMProvider, ProviderInfo, WireFormat};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct SimpleExternalProvider {
    provider: ApiProvider,
    endpoint: String,
    api_key: String,
    model: String,
    client: Client,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    system: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: usize,
    temperature: f32,
    top_p: f32,
}

#[derive(Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl SimpleExternalProvider {
    pub fn new(
        provider: ApiProvider,
        api_key: String,
        model: String,
        request_timeout_secs: u64,
    ) -> Result<Self> {
        if api_key.is_empty() && provider.requires_api_key() {
            bail!("API key required for provider {}", provider.label());
        }
        if model.trim().is_empty() {
            bail!("model name required for provider {}", provider.label());
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(request_timeout_secs.max(1)))
            .build()
            .context("building HTTP client")?;

        let endpoint = provider.endpoint();
        tracing::info!(provider = provider.label(), model = %model, endpoint = %endpoint, "LLM provider configured");

        Ok(Self {
            provider,
            endpoint,
            api_key,
            model,
            client,
        })
    }

    fn system_then_user<'a>(system: &'a str, prompt: &'a str) -> Vec<Message<'a>> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: prompt,
        });
        messages
    }

    async fn post<B: Serialize>(&self, body: &B) -> Result<String> {
        let mut request = self.client.post(&self.endpoint).json(body);
        request = match self.provider.wire_format() {
            WireFormat::AnthropicMessages => request
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            WireFormat::ChatCompletions if !self.api_key.is_empty() => request.bearer_auth(&self.api_key),
            WireFormat::ChatCompletions => request,
        };

        let response = request.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                "timed out"
            } else if e.is_connect() {
                "could not connect"
            } else {
                "failed"
            };
            tracing::warn!(endpoint = %self.endpoint, error = %e, "LLM request {}", kind);
            anyhow!("request to {} {}: {}", self.endpoint, kind, e)
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("reading response body from {}", self.endpoint))?;
        if !status.is_success() {
            bail!("{} returned HTTP {}: {}", self.provider.label(), status, preview(&body, 300));
        }
        // Gateways sometimes answer with an HTML error page and a 200.
        if body.trim_start().starts_with('<') {
            bail!("{} returned HTML instead of JSON: {}", self.endpoint, preview(&body, 200));
        }
        Ok(body)
    }

    fn completion_text(format: WireFormat, body: &str) -> Result<String> {
        let text = match format {
            WireFormat::ChatCompletions => {
                let parsed: ChatCompletionsResponse = serde_json::from_str(body)
                    .with_context(|| format!("unexpected completion body: {}", preview(body, 300)))?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default()
            }
            WireFormat::AnthropicMessages => {
                let parsed: AnthropicResponse = serde_json::from_str(body)
                    .with_context(|| format!("unexpected messages body: {}", preview(body, 300)))?;
                parsed
                    .content
                    .into_iter()
                    .filter(|block| block.kind == "text")
                    .map(|block| block.text)
                    .collect::<Vec<_>>()
                    .join("")
            }
        };
        if text.trim().is_empty() {
            bail!("empty completion");
        }
        Ok(text)
    }
}

fn is_blank(s: &&str) -> bool {
    s.trim().is_empty()
}

fn preview(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

#[async_trait]
impl LLMProvider for SimpleExternalProvider {
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        let format = self.provider.wire_format();
        let body = match format {
            WireFormat::ChatCompletions => {
                self.post(&ChatCompletionsRequest {
                    model: &self.model,
                    messages: Self::system_then_user(&config.system_prompt, prompt),
                    max_tokens: config.max_tokens,
                    temperature: config.temperature,
                    top_p: config.top_p,
                    stream: false,
                })
                .await?
            }
            WireFormat::AnthropicMessages => {
                self.post(&AnthropicRequest {
                    model: &self.model,
                    system: &config.system_prompt,
                    messages: Self::system_then_user("", prompt),
                    max_tokens: config.max_tokens,
                    temperature: config.temperature,
                    top_p: config.top_p,
                })
                .await?
            }
        };
        Self::completion_text(format, &body)
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: self.provider.label().to_string(),
            model: self.model.clone(),
            is_local: matches!(self.provider, ApiProvider::Ollama),
        }
    }
}
