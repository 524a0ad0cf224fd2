use crate::image::{ImagePipeline, RetryPolicy};
use crate::llm_provider::*;
use anyhow::{anyhow, Context, Result};
use lessonforge_core::{ImageConfig, LLMConfig};
use std::sync::Arc;

#[cfg(feature = "anthropic")]
use crate::anthropic_provider::{AnthropicConfig, AnthropicProvider};

#[cfg(feature = "openai-compatible")]
use crate::image::VisionProvider;
#[cfg(feature = "openai-compatible")]
use crate::openai_compatible_provider::{
    OpenAICompatibleConfig, OpenAICompatibleProvider, OpenAIImageProvider,
};

/// Factory for creating AI providers based on configuration
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    /// Create the text provider from configuration
    pub fn create_from_config(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        Self::create_with_model(config, config.model.clone())
    }

    /// Create the provider used for item-set fields; uses `structured_model`
    /// when set.
    pub fn create_structured_from_config(config: &LLMConfig) -> Result<Arc<dyn LLMProvider>> {
        Self::create_with_model(
            config,
            config.structured_model.clone().or_else(|| config.model.clone()),
        )
    }

    fn create_with_model(config: &LLMConfig, model: Option<String>) -> Result<Arc<dyn LLMProvider>> {
        let provider_name = config.provider.to_lowercase();

        match provider_name.as_str() {
            #[cfg(feature = "anthropic")]
            "anthropic" => Self::create_anthropic_provider(config, model),
            #[cfg(feature = "openai-compatible")]
            "openai" | "openai-compatible" | "lmstudio" | "ollama" => {
                Self::create_openai_compatible_provider(config, &provider_name, model)
            }
            _ => Err(anyhow!(
                "Unsupported LLM provider: {}. Available providers: {}",
                provider_name,
                Self::supported_providers().join(", ")
            )),
        }
    }

    /// Create an Anthropic Claude provider
    #[cfg(feature = "anthropic")]
    fn create_anthropic_provider(
        config: &LLMConfig,
        model: Option<String>,
    ) -> Result<Arc<dyn LLMProvider>> {
        let api_key = config
            .anthropic_api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                anyhow!(
                    "Anthropic API key not found. Set 'anthropic_api_key' in config \
                     or ANTHROPIC_API_KEY environment variable"
                )
            })?;

        let defaults = AnthropicConfig::default();
        let anthropic_config = AnthropicConfig {
            api_key,
            model: model.unwrap_or(defaults.model),
            context_window: defaults.context_window,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        };

        Ok(Arc::new(
            AnthropicProvider::new(anthropic_config).context("Failed to create Anthropic provider")?,
        ))
    }

    /// Create an OpenAI or OpenAI-compatible provider
    #[cfg(feature = "openai-compatible")]
    fn create_openai_compatible_provider(
        config: &LLMConfig,
        provider_name: &str,
        model: Option<String>,
    ) -> Result<Arc<dyn LLMProvider>> {
        let mut compat_config = match provider_name {
            "openai" => {
                let api_key = config
                    .openai_api_key
                    .clone()
                    .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                    .ok_or_else(|| {
                        anyhow!(
                            "OpenAI API key not found. Set 'openai_api_key' in config \
                             or OPENAI_API_KEY environment variable"
                        )
                    })?;
                OpenAICompatibleConfig::openai(
                    model.clone().unwrap_or_else(|| "gpt-4o".to_string()),
                    api_key,
                )
            }
            "lmstudio" => OpenAICompatibleConfig::lm_studio(
                model.clone().unwrap_or_else(|| "local-model".to_string()),
            ),
            "ollama" => OpenAICompatibleConfig::ollama(
                model.clone().unwrap_or_else(|| "llama3.1".to_string()),
            ),
            _ => {
                let base_url = config.base_url.clone().ok_or_else(|| {
                    anyhow!("OpenAI-compatible base URL not found. Set 'base_url' in [llm]")
                })?;
                OpenAICompatibleConfig {
                    base_url,
                    model: model.clone().ok_or_else(|| {
                        anyhow!("Model name is required for OpenAI-compatible provider")
                    })?,
                    api_key: config.openai_api_key.clone(),
                    ..Default::default()
                }
            }
        };

        if let Some(base_url) = &config.base_url {
            compat_config.base_url = base_url.trim_end_matches('/').to_string();
        }
        compat_config.timeout_secs = config.timeout_secs;
        compat_config.max_retries = config.max_retries;

        Ok(Arc::new(
            OpenAICompatibleProvider::new(compat_config)
                .context("Failed to create OpenAI-compatible provider")?,
        ))
    }

    /// Build the image pipeline: primary and secondary image models, and a
    /// vision model for alt text when one is configured. `None` when image
    /// generation is disabled.
    pub fn create_image_pipeline(
        image: &ImageConfig,
        llm: &LLMConfig,
    ) -> Result<Option<ImagePipeline>> {
        if !image.enabled {
            return Ok(None);
        }

        #[cfg(feature = "openai-compatible")]
        {
            let api_key = llm
                .openai_api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
            let primary = OpenAIImageProvider::new(
                image.base_url.clone(),
                image.primary_model.clone(),
                api_key.clone(),
                llm.timeout_secs,
            )
            .context("Failed to create primary image provider")?;
            let secondary = OpenAIImageProvider::new(
                image.base_url.clone(),
                image.secondary_model.clone(),
                api_key.clone(),
                llm.timeout_secs,
            )
            .context("Failed to create secondary image provider")?;

            let mut pipeline = ImagePipeline::new(Arc::new(primary), RetryPolicy::from(image))
                .with_secondary(Arc::new(secondary));

            if let Some(vision_model) = &image.vision_model {
                let vision: Arc<dyn VisionProvider> = Arc::new(
                    OpenAICompatibleProvider::new(OpenAICompatibleConfig {
                        base_url: image.base_url.clone(),
                        model: vision_model.clone(),
                        api_key,
                        timeout_secs: llm.timeout_secs,
                        provider_name: "vision".to_string(),
                        ..Default::default()
                    })
                    .context("Failed to create vision provider")?,
                );
                pipeline = pipeline.with_vision(vision);
            }

            Ok(Some(pipeline))
        }

        #[cfg(not(feature = "openai-compatible"))]
        {
            let _ = llm;
            Err(anyhow!(
                "Image generation requires the 'openai-compatible' feature. \
                 Rebuild with --features openai-compatible or set image.enabled = false."
            ))
        }
    }

    /// Check if a provider is reachable
    pub async fn check_availability(provider: &Arc<dyn LLMProvider>) -> bool {
        provider.is_available().await
    }

    /// Get a list of supported providers (based on enabled features)
    pub fn supported_providers() -> Vec<&'static str> {
        #[allow(unused_mut)]
        let mut providers = Vec::new();

        #[cfg(feature = "anthropic")]
        providers.push("anthropic");

        #[cfg(feature = "openai-compatible")]
        providers.extend(["openai", "openai-compatible", "lmstudio", "ollama"]);

        providers
    }
}
