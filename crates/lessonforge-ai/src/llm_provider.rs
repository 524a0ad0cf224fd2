use async_trait::async_trait;
use lessonforge_core::OutputSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Failure of an AI service call.
#[derive(Error, Debug)]
pub enum AiError {
    /// The call itself failed: network, timeout, non-success status
    #[error("AI transport error: {0}")]
    Transport(String),

    /// The service answered but the payload could not be interpreted
    #[error("Malformed AI response: {0}")]
    MalformedResponse(String),

    #[error("AI provider configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        AiError::Transport(e.to_string())
    }
}

/// Result type for LLM operations
pub type LLMResult<T> = Result<T, AiError>;

/// Performance characteristics of an LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCharacteristics {
    /// Maximum tokens that can be processed in a single request
    pub max_tokens: usize,
    /// Typical latency in milliseconds (for estimation)
    pub avg_latency_ms: u64,
    /// Requests per minute limit (for rate limiting)
    pub rpm_limit: Option<u64>,
    /// Whether the provider can be constrained to a JSON schema natively
    pub supports_structured_output: bool,
}

/// Sampling parameters for one completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Temperature for sampling (0.0 to 2.0)
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: Option<usize>,
    /// Stop sequences
    pub stop: Option<Vec<String>>,
    /// Output constraint; providers translate this to their native form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: Some(2048),
            stop: None,
            response_format: None,
        }
    }
}

/// Named JSON schema an answer must conform to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonSchemaSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schema: Value,
    pub strict: bool,
}

impl JsonSchemaSpec {
    pub fn from_output_schema(schema: &OutputSchema) -> Self {
        Self {
            name: schema.name.clone(),
            description: Some(schema.description.clone()),
            schema: schema.to_json_schema(),
            strict: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonSchema { json_schema: JsonSchemaSpec },
}

/// A message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Role of a message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// Response from the LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    /// Generated text content
    pub content: String,
    /// Total tokens used in the request
    pub total_tokens: Option<usize>,
    /// Finish reason (e.g., "stop", "length")
    pub finish_reason: Option<String>,
    /// Model used for generation
    pub model: String,
}

/// Main trait for LLM providers
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a completion for a single prompt
    async fn generate(&self, prompt: &str) -> LLMResult<LLMResponse> {
        self.generate_chat(&[Message::user(prompt)], &CompletionOptions::default())
            .await
    }

    /// Generate a chat completion with message history
    async fn generate_chat(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> LLMResult<LLMResponse>;

    /// Generate a JSON answer constrained to `schema`.
    ///
    /// The default asks for a JSON-schema response format and parses the
    /// text that comes back; providers with a native mechanism override it.
    async fn generate_structured(
        &self,
        messages: &[Message],
        schema: &OutputSchema,
        options: &CompletionOptions,
    ) -> LLMResult<Value> {
        let mut options = options.clone();
        options.response_format = Some(ResponseFormat::JsonSchema {
            json_schema: JsonSchemaSpec::from_output_schema(schema),
        });
        let response = self.generate_chat(messages, &options).await?;
        parse_json_payload(&response.content)
    }

    /// Check if the provider is available and ready
    async fn is_available(&self) -> bool;

    /// Get the name of this provider
    fn provider_name(&self) -> &str;

    /// Get the model identifier
    fn model_name(&self) -> &str;

    /// Get performance characteristics
    fn characteristics(&self) -> ProviderCharacteristics;

    /// Get the maximum context window size
    fn context_window(&self) -> usize {
        self.characteristics().max_tokens
    }
}

/// Extract a JSON document from model text, tolerating a markdown fence
/// around it.
pub fn parse_json_payload(content: &str) -> LLMResult<Value> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| {
        AiError::MalformedResponse(format!("response is not valid JSON ({e})"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_and_fenced_json() {
        let plain = parse_json_payload(r#"{"items": []}"#).unwrap();
        assert!(plain["items"].is_array());

        let fenced = parse_json_payload("```json\n{\"items\": [1]}\n```").unwrap();
        assert_eq!(fenced["items"][0], 1);
    }

    #[test]
    fn test_non_json_is_malformed() {
        let err = parse_json_payload("Sure! Here are your questions.").unwrap_err();
        assert!(matches!(err, AiError::MalformedResponse(_)));
    }

    #[test]
    fn test_response_format_serialization() {
        let format = ResponseFormat::JsonSchema {
            json_schema: JsonSchemaSpec {
                name: "question_set".into(),
                description: None,
                schema: serde_json::json!({ "type": "object" }),
                strict: true,
            },
        };
        let json = serde_json::to_value(&format).unwrap();
        assert_eq!(json["type"], "json_schema");
        assert_eq!(json["json_schema"]["name"], "question_set");
    }
}
