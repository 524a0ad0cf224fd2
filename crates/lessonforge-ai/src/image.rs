//! Image generation with retry, backoff and a secondary provider, plus
//! optional alt text from a vision model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lessonforge_core::ImageConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm_provider::LLMResult;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    /// Temporary capacity problem on the provider side; worth retrying
    #[error("image provider overloaded: {0}")]
    Overloaded(String),

    #[error("image generation failed: {0}")]
    Failed(String),
}

impl ImageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ImageError::Overloaded(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub model_used: String,
    pub alt_text: Option<String>,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate_image(&self, prompt: &str) -> Result<GeneratedImage, ImageError>;

    fn model_name(&self) -> &str;
}

/// Describes an image in a sentence, used for alt text.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn describe_image(&self, bytes: &[u8], content_type: &str) -> LLMResult<String>;
}

/// Exponential backoff between attempts against the primary provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ImageConfig::default())
    }
}

impl From<&ImageConfig> for RetryPolicy {
    fn from(config: &ImageConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            multiplier: config.backoff_multiplier,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff_ms: 0,
            multiplier: 1.0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before attempt `attempt` (1-based); the first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 2);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Primary provider with retries, then the secondary, then alt text.
pub struct ImagePipeline {
    primary: Arc<dyn ImageProvider>,
    secondary: Option<Arc<dyn ImageProvider>>,
    vision: Option<Arc<dyn VisionProvider>>,
    policy: RetryPolicy,
}

impl ImagePipeline {
    pub fn new(primary: Arc<dyn ImageProvider>, policy: RetryPolicy) -> Self {
        Self {
            primary,
            secondary: None,
            vision: None,
            policy,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn ImageProvider>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_vision(mut self, vision: Arc<dyn VisionProvider>) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn generate(&self, prompt: &str) -> Result<GeneratedImage, ImageError> {
        let mut image = match self.generate_with_primary(prompt).await {
            Ok(image) => image,
            Err(primary_err) => match &self.secondary {
                Some(secondary) => {
                    warn!(
                        "Primary image model {} gave up ({}), falling back to {}",
                        self.primary.model_name(),
                        primary_err,
                        secondary.model_name()
                    );
                    secondary.generate_image(prompt).await?
                }
                None => return Err(primary_err),
            },
        };

        if image.alt_text.as_deref().map_or(true, |a| a.trim().is_empty()) {
            image.alt_text = self.describe(&image).await;
        }
        Ok(image)
    }

    async fn generate_with_primary(&self, prompt: &str) -> Result<GeneratedImage, ImageError> {
        let mut attempt = 1;
        loop {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.primary.generate_image(prompt).await {
                Ok(image) => {
                    debug!(
                        "Image generated by {} on attempt {}",
                        image.model_used, attempt
                    );
                    return Ok(image);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    warn!(
                        "Image provider overloaded (attempt {}/{}), retrying...",
                        attempt, self.policy.max_attempts
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Alt text is optional; a failing vision call leaves it empty.
    async fn describe(&self, image: &GeneratedImage) -> Option<String> {
        let vision = self.vision.as_ref()?;
        match vision.describe_image(&image.bytes, &image.content_type).await {
            Ok(text) if !text.trim().is_empty() => {
                info!("Generated alt text for image from {}", image.model_used);
                Some(text.trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Alt text generation failed: {}", e);
                None
            }
        }
    }
}
