pub mod image;
pub mod llm_factory;
pub mod llm_provider;

// HTTP providers
#[cfg(feature = "anthropic")]
pub mod anthropic_provider;
#[cfg(feature = "openai-compatible")]
pub mod openai_compatible_provider;

pub use image::{GeneratedImage, ImageError, ImagePipeline, ImageProvider, RetryPolicy, VisionProvider};
pub use llm_factory::LLMProviderFactory;
pub use llm_provider::*;
