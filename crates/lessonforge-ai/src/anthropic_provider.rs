use crate::image::VisionProvider;
use crate::llm_provider::*;
use async_trait::async_trait;
use base64::Engine as _;
use lessonforge_core::OutputSchema;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";

/// Configuration for Anthropic Claude provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// API key for Anthropic
    pub api_key: String,
    /// Model to use
    pub model: String,
    /// Maximum context window
    pub context_window: usize,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum retries for failed requests
    pub max_retries: u32,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: DEFAULT_MODEL.to_string(),
            context_window: 200_000,
            timeout_secs: 120,
            max_retries: 0,
        }
    }
}

/// Anthropic Claude LLM provider
pub struct AnthropicProvider {
    config: AnthropicConfig,
    client: Client,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider
    pub fn new(config: AnthropicConfig) -> LLMResult<Self> {
        if config.api_key.is_empty() {
            return Err(AiError::Configuration(
                "Anthropic API key is required. Set ANTHROPIC_API_KEY environment variable."
                    .to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AiError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Create from environment variables
    pub fn from_env() -> LLMResult<Self> {
        Self::new(AnthropicConfig::default())
    }

    fn build_request(&self, messages: &[Message], options: &CompletionOptions) -> AnthropicRequest {
        AnthropicRequest {
            model: self.config.model.clone(),
            messages: messages
                .iter()
                .filter(|m| !matches!(m.role, MessageRole::System))
                .map(|m| AnthropicMessage {
                    role: match m.role {
                        MessageRole::Assistant => "assistant".to_string(),
                        _ => "user".to_string(),
                    },
                    content: Value::String(m.content.clone()),
                })
                .collect(),
            system: messages
                .iter()
                .find(|m| matches!(m.role, MessageRole::System))
                .map(|m| m.content.clone()),
            max_tokens: options.max_tokens.unwrap_or(4096),
            temperature: Some(options.temperature),
            stop_sequences: options.stop.clone(),
            tools: None,
            tool_choice: None,
        }
    }

    /// Send a request to Anthropic API with retry logic
    async fn send_request(&self, request: &AnthropicRequest) -> LLMResult<AnthropicResponse> {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = Duration::from_secs(2u64.pow(attempt - 1));
                tokio::time::sleep(delay).await;
            }

            match self.try_request(request).await {
                Ok(response) => return Ok(response),
                Err(e @ AiError::Transport(_)) => {
                    last_error = Some(e);
                    if attempt < self.config.max_retries {
                        tracing::warn!(
                            "Anthropic request failed (attempt {}/{}), retrying...",
                            attempt + 1,
                            self.config.max_retries + 1
                        );
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| AiError::Transport("All retry attempts failed".into())))
    }

    /// Try a single request to Anthropic API
    async fn try_request(&self, request: &AnthropicRequest) -> LLMResult<AnthropicResponse> {
        let response = self
            .client
            .post(format!("{}/messages", ANTHROPIC_API_BASE))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| AiError::Transport(format!("Failed to send request to Anthropic API: {e}")))?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(AiError::Transport(format!(
                "Anthropic API error ({}): {}",
                status, error_text
            )));
        }

        response.json::<AnthropicResponse>().await.map_err(|e| {
            AiError::MalformedResponse(format!("Failed to parse Anthropic API response: {e}"))
        })
    }
}

fn text_of(response: &AnthropicResponse) -> String {
    response
        .content
        .iter()
        .filter(|c| c.content_type == "text")
        .filter_map(|c| c.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn generate_chat(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> LLMResult<LLMResponse> {
        let request = self.build_request(messages, options);
        let response = self.send_request(&request).await?;

        Ok(LLMResponse {
            content: text_of(&response),
            total_tokens: Some(response.usage.input_tokens + response.usage.output_tokens),
            finish_reason: response.stop_reason,
            model: response.model,
        })
    }

    /// Structured output through a single forced tool call whose input
    /// schema is the requested schema.
    async fn generate_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
        options: &CompletionOptions,
    ) -> LLMResult<Value> {
        let mut request = self.build_request(messages, options);
        request.tools = Some(vec![json!({
            "name": schema.name,
            "description": schema.description,
            "input_schema": schema.to_json_schema(),
        })]);
        request.tool_choice = Some(json!({ "type": "tool", "name": schema.name }));

        let response = self.send_request(&request).await?;
        response
            .content
            .into_iter()
            .find(|c| c.content_type == "tool_use")
            .and_then(|c| c.input)
            .ok_or_else(|| {
                AiError::MalformedResponse("Anthropic response carried no tool_use block".into())
            })
    }

    async fn is_available(&self) -> bool {
        let options = CompletionOptions {
            max_tokens: Some(1),
            ..Default::default()
        };
        self.generate_chat(&[Message::user("test")], &options)
            .await
            .is_ok()
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn characteristics(&self) -> ProviderCharacteristics {
        ProviderCharacteristics {
            max_tokens: self.config.context_window,
            avg_latency_ms: 1000,
            rpm_limit: Some(50),
            supports_structured_output: true,
        }
    }
}

#[async_trait]
impl VisionProvider for AnthropicProvider {
    async fn describe_image(&self, bytes: &[u8], content_type: &str) -> LLMResult<String> {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        let mut request = self.build_request(&[], &CompletionOptions::default());
        request.max_tokens = 200;
        request.messages = vec![AnthropicMessage {
            role: "user".to_string(),
            content: json!([
                {
                    "type": "image",
                    "source": { "type": "base64", "media_type": content_type, "data": data }
                },
                {
                    "type": "text",
                    "text": "Write one sentence of alt text describing this image for a student who cannot see it."
                }
            ]),
        }];

        let response = self.send_request(&request).await?;
        Ok(text_of(&response))
    }
}

// Anthropic API request/response types

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: usize,
    output_tokens: usize,
}
