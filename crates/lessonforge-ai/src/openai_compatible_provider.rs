use crate::image::{GeneratedImage, ImageError, ImageProvider, VisionProvider};
use crate::llm_provider::*;
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Configuration for OpenAI-compatible providers (OpenAI, LM Studio, Ollama, etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAICompatibleConfig {
    /// Base URL for the API (e.g., "http://localhost:1234/v1")
    pub base_url: String,
    /// Model to use
    pub model: String,
    /// Maximum context window
    pub context_window: usize,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Maximum retries for failed requests
    pub max_retries: u32,
    /// Optional API key (some providers require it, some don't)
    pub api_key: Option<String>,
    /// Provider name for display purposes
    pub provider_name: String,
}

impl Default for OpenAICompatibleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            model: "local-model".to_string(),
            context_window: 128_000,
            timeout_secs: 120,
            max_retries: 0,
            api_key: None,
            provider_name: "openai-compatible".to_string(),
        }
    }
}

impl OpenAICompatibleConfig {
    /// Create config for the hosted OpenAI API
    pub fn openai(model: String, api_key: String) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model,
            api_key: Some(api_key),
            provider_name: "openai".to_string(),
            ..Default::default()
        }
    }

    /// Create config for LM Studio
    pub fn lm_studio(model: String) -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            model,
            provider_name: "lmstudio".to_string(),
            ..Default::default()
        }
    }

    /// Create config for Ollama (OpenAI-compatible endpoint)
    pub fn ollama(model: String) -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model,
            provider_name: "ollama".to_string(),
            ..Default::default()
        }
    }
}

/// OpenAI-compatible LLM provider (Chat Completions API)
pub struct OpenAICompatibleProvider {
    config: OpenAICompatibleConfig,
    client: Client,
}

fn http_client(timeout_secs: u64) -> LLMResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AiError::Configuration(format!("Failed to create HTTP client: {e}")))
}

impl OpenAICompatibleProvider {
    /// Create a new OpenAI-compatible provider
    pub fn new(config: OpenAICompatibleConfig) -> LLMResult<Self> {
        let client = http_client(config.timeout_secs)?;
        Ok(Self { config, client })
    }

    /// Create for LM Studio
    pub fn lm_studio(model: String) -> LLMResult<Self> {
        Self::new(OpenAICompatibleConfig::lm_studio(model))
    }

    /// Create for Ollama
    pub fn ollama(model: String) -> LLMResult<Self> {
        Self::new(OpenAICompatibleConfig::ollama(model))
    }

    fn build_request(&self, messages: Vec<ChatMessage>, options: &CompletionOptions) -> ChatCompletionsRequest {
        ChatCompletionsRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: options.max_tokens,
            temperature: Some(options.temperature),
            stop: options.stop.clone(),
            response_format: options.response_format.clone(),
        }
    }

    /// Send a request with retry logic
    async fn send_request(
        &self,
        request: &ChatCompletionsRequest,
    ) -> LLMResult<ChatCompletionsResponse> {
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
                            "{} request failed (attempt {}/{}), retrying...",
                            self.config.provider_name,
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

    async fn try_request(
        &self,
        request: &ChatCompletionsRequest,
    ) -> LLMResult<ChatCompletionsResponse> {
        let mut request_builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Content-Type", "application/json")
            .json(request);

        if let Some(api_key) = &self.config.api_key {
            request_builder =
                request_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request_builder.send().await.map_err(|e| {
            AiError::Transport(format!(
                "Failed to send request to {} at {}: {e}",
                self.config.provider_name, self.config.base_url
            ))
        })?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(AiError::Transport(format!(
                "{} API error ({}): {}",
                self.config.provider_name, status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            AiError::MalformedResponse(format!(
                "Failed to parse {} Chat Completions response: {e}",
                self.config.provider_name
            ))
        })
    }
}

fn first_choice(response: ChatCompletionsResponse) -> LLMResult<(ChatChoice, Option<ChatUsage>)> {
    let usage = response.usage;
    response
        .choices
        .into_iter()
        .next()
        .map(|c| (c, usage))
        .ok_or_else(|| AiError::MalformedResponse("No choices in response".into()))
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate_chat(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> LLMResult<LLMResponse> {
        let chat_messages = messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.to_string(),
                content: Value::String(m.content.clone()),
            })
            .collect();
        let request = self.build_request(chat_messages, options);
        let (choice, usage) = first_choice(self.send_request(&request).await?)?;

        Ok(LLMResponse {
            content: choice.message.text(),
            total_tokens: usage.map(|u| u.total_tokens),
            finish_reason: choice.finish_reason,
            model: self.config.model.clone(),
        })
    }

    async fn is_available(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/models", self.config.base_url))
            .send()
            .await;

        result.is_ok()
    }

    fn provider_name(&self) -> &str {
        &self.config.provider_name
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn characteristics(&self) -> ProviderCharacteristics {
        ProviderCharacteristics {
            max_tokens: self.config.context_window,
            avg_latency_ms: 1500,
            rpm_limit: None,
            supports_structured_output: true,
        }
    }
}

#[async_trait]
impl VisionProvider for OpenAICompatibleProvider {
    async fn describe_image(&self, bytes: &[u8], content_type: &str) -> LLMResult<String> {
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        let message = ChatMessage {
            role: "user".to_string(),
            content: json!([
                {
                    "type": "text",
                    "text": "Write one sentence of alt text describing this image for a student who cannot see it."
                },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:{content_type};base64,{data}") }
                }
            ]),
        };
        let options = CompletionOptions {
            max_tokens: Some(200),
            ..Default::default()
        };
        let request = self.build_request(vec![message], &options);
        let (choice, _) = first_choice(self.send_request(&request).await?)?;
        Ok(choice.message.text())
    }
}

/// Image generation against an OpenAI-style `/images/generations` endpoint.
pub struct OpenAIImageProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    size: String,
    client: Client,
}

impl OpenAIImageProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout_secs: u64,
    ) -> LLMResult<Self> {
        Ok(Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            size: "1024x1024".to_string(),
            client: http_client(timeout_secs)?,
        })
    }
}

/// 429 and 5xx capacity answers are worth retrying; anything else is final.
fn classify_image_status(status: StatusCode, body: String) -> ImageError {
    let retryable = status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::GATEWAY_TIMEOUT
        || status.as_u16() == 529;
    let message = format!("({status}) {body}");
    if retryable {
        ImageError::Overloaded(message)
    } else {
        ImageError::Failed(message)
    }
}

#[async_trait]
impl ImageProvider for OpenAIImageProvider {
    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, ImageError> {
        let request = ImageRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            n: 1,
            size: self.size.clone(),
        };

        let mut request_builder = self
            .client
            .post(format!("{}/images/generations", self.base_url))
            .json(&request);
        if let Some(api_key) = &self.api_key {
            request_builder =
                request_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request_builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ImageError::Overloaded(e.to_string())
            } else {
                ImageError::Failed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_image_status(status, body));
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| ImageError::Failed(format!("unreadable image response: {e}")))?;
        let datum = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ImageError::Failed("image response had no data".into()))?;

        let bytes = match (datum.b64_json, datum.url) {
            (Some(b64), _) => base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| ImageError::Failed(format!("invalid base64 image: {e}")))?,
            (None, Some(url)) => self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| ImageError::Failed(e.to_string()))?
                .bytes()
                .await
                .map_err(|e| ImageError::Failed(e.to_string()))?
                .to_vec(),
            (None, None) => return Err(ImageError::Failed("image response had no payload".into())),
        };

        Ok(GeneratedImage {
            bytes,
            content_type: "image/png".to_string(),
            model_used: self.model.clone(),
            alt_text: datum.revised_prompt,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// API request/response types for Chat Completions API

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    /// Plain string or an array of typed content parts
    #[serde(default)]
    content: Value,
}

impl ChatMessage {
    fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: usize,
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    model: String,
    prompt: String,
    n: u32,
    size: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lm_studio_config() {
        let config = OpenAICompatibleConfig::lm_studio("test-model".to_string());
        assert_eq!(config.base_url, "http://localhost:1234/v1");
        assert_eq!(config.provider_name, "lmstudio");
    }

    #[test]
    fn test_ollama_config() {
        let config = OpenAICompatibleConfig::ollama("llama3".to_string());
        assert_eq!(config.base_url, "http://localhost:11434/v1");
        assert_eq!(config.provider_name, "ollama");
    }

    #[test]
    fn test_response_format_is_forwarded() {
        let provider = OpenAICompatibleProvider::lm_studio("m".into()).unwrap();
        let options = CompletionOptions {
            response_format: Some(ResponseFormat::JsonSchema {
                json_schema: JsonSchemaSpec {
                    name: "question_set".into(),
                    description: None,
                    schema: json!({ "type": "object" }),
                    strict: true,
                },
            }),
            ..Default::default()
        };
        let request = provider.build_request(Vec::new(), &options);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn test_image_status_classification() {
        assert!(classify_image_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_image_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(!classify_image_status(StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }

    #[test]
    fn test_message_text_from_parts() {
        let message: ChatMessage = serde_json::from_value(json!({
            "role": "assistant",
            "content": [{ "type": "text", "text": "A leaf" }, { "type": "text", "text": " in sun." }]
        }))
        .unwrap();
        assert_eq!(message.text(), "A leaf in sun.");
    }
}
