use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for LessonForge
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LessonForgeConfig {
    /// Text and structured completion provider
    #[serde(default)]
    pub llm: LLMConfig,

    /// Image generation providers and their retry policy
    #[serde(default)]
    pub image: ImageConfig,

    /// Where lesson responses are persisted
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM configuration for field generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// LLM provider: "anthropic", "openai", "openai-compatible", "lmstudio", "ollama"
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model identifier for text fields
    #[serde(default)]
    pub model: Option<String>,

    /// Model identifier for structured (item-set) fields; falls back to `model`
    #[serde(default)]
    pub structured_model: Option<String>,

    /// Base URL for OpenAI-compatible endpoints
    #[serde(default)]
    pub base_url: Option<String>,

    /// Anthropic API key
    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    /// OpenAI API key
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Maximum tokens to generate per field
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Transport-level retries inside the HTTP provider
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: None,
            structured_model: None,
            base_url: None,
            anthropic_api_key: None,
            openai_api_key: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
        }
    }
}

/// Image generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Disable to skip image fields entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the image API (OpenAI-compatible)
    #[serde(default = "default_image_base_url")]
    pub base_url: String,

    /// Primary image model
    #[serde(default = "default_primary_image_model")]
    pub primary_model: String,

    /// Secondary image model used after the primary gives up
    #[serde(default = "default_secondary_image_model")]
    pub secondary_model: String,

    /// Vision model used to describe images that come back without alt text
    #[serde(default)]
    pub vision_model: Option<String>,

    /// Attempts against the primary before falling back (default: 3)
    #[serde(default = "default_image_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt (default: 1000ms)
    #[serde(default = "default_image_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Backoff ceiling (default: 8000ms)
    #[serde(default = "default_image_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_image_base_url(),
            primary_model: default_primary_image_model(),
            secondary_model: default_secondary_image_model(),
            vision_model: None,
            max_attempts: default_image_max_attempts(),
            initial_backoff_ms: default_image_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_image_max_backoff_ms(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for persisted lesson responses
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "compact", "full"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}
fn default_max_tokens() -> usize {
    2048
}
fn default_temperature() -> f32 {
    0.7
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_image_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_primary_image_model() -> String {
    "gpt-image-1".to_string()
}
fn default_secondary_image_model() -> String {
    "dall-e-3".to_string()
}
fn default_image_max_attempts() -> u32 {
    3
}
fn default_image_initial_backoff_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_image_max_backoff_ms() -> u64 {
    8000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager with layered sources
pub struct ConfigManager {
    config: LessonForgeConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.lessonforge.toml)
    /// 3. Sensible defaults
    pub fn load() -> Result<Self, ConfigError> {
        info!("Loading LessonForge configuration...");

        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        info!("Configuration loaded successfully");
        if let Some(ref path) = config_path {
            info!("   Config file: {}", path.display());
        } else {
            info!("   Config file: NONE (using defaults)");
        }
        info!("   LLM provider: {}", config.llm.provider);
        info!("   LLM model: {:?}", config.llm.model);
        info!(
            "   Image generation: {}",
            if config.image.enabled {
                "enabled"
            } else {
                "disabled"
            }
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load a specific config file, still applying env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_dotenv();
        let config = Self::apply_env_overrides(Self::read_toml_file(path)?);
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Load .env file if it exists
    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            } else {
                info!("Loaded .env file from current directory");
            }
            return;
        }

        if let Some(home) = dirs::home_dir() {
            let home_env = home.join(".lessonforge.env");
            if home_env.exists() {
                if let Err(e) = dotenv::from_path(&home_env) {
                    warn!("Failed to load .lessonforge.env: {}", e);
                } else {
                    info!("Loaded .lessonforge.env from home directory");
                }
            }
        }
    }

    /// Find and load config file
    /// Search order:
    /// 1. ./.lessonforge.toml (current directory)
    /// 2. ~/.lessonforge/config.toml (user config)
    /// 3. Use defaults
    fn load_config_file() -> Result<(LessonForgeConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".lessonforge.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".lessonforge").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        info!("No config file found, using defaults");
        Ok((LessonForgeConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<LessonForgeConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: LessonForgeConfig) -> LessonForgeConfig {
        if let Ok(provider) =
            std::env::var("LESSONFORGE_LLM_PROVIDER").or_else(|_| std::env::var("LLM_PROVIDER"))
        {
            config.llm.provider = provider;
        }
        if let Ok(model) = std::env::var("LESSONFORGE_MODEL") {
            config.llm.model = Some(model);
        }
        if let Ok(model) = std::env::var("LESSONFORGE_STRUCTURED_MODEL") {
            config.llm.structured_model = Some(model);
        }
        if let Ok(url) = std::env::var("LESSONFORGE_LLM_BASE_URL") {
            config.llm.base_url = Some(url);
        }
        if let Ok(tokens) = std::env::var("LESSONFORGE_MAX_TOKENS") {
            if let Ok(n) = tokens.parse() {
                config.llm.max_tokens = n;
            }
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            config.llm.anthropic_api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm.openai_api_key = Some(key);
        }

        if let Ok(enabled) = std::env::var("LESSONFORGE_IMAGE_ENABLED") {
            config.image.enabled = enabled.to_lowercase() == "true" || enabled == "1";
        }
        if let Ok(attempts) = std::env::var("LESSONFORGE_IMAGE_MAX_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                config.image.max_attempts = n;
            }
        }

        if let Ok(dir) = std::env::var("LESSONFORGE_DATA_DIR") {
            config.storage.data_dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("RUST_LOG") {
            config.logging.level = level;
        }

        config
    }

    /// Validate configuration
    fn validate_config(config: &LessonForgeConfig) -> Result<(), ConfigError> {
        match config.llm.provider.as_str() {
            "anthropic" | "openai" | "openai-compatible" | "lmstudio" | "ollama" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid LLM provider: {}. Must be one of: anthropic, openai, openai-compatible, lmstudio, ollama",
                    other
                )))
            }
        }

        if config.llm.max_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "llm.max_tokens must be greater than zero".to_string(),
            ));
        }

        if config.image.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "image.max_attempts must be at least 1".to_string(),
            ));
        }
        if config.image.backoff_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "image.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }

        match config.logging.format.as_str() {
            "pretty" | "compact" | "full" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, compact, full",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &LessonForgeConfig {
        &self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = LessonForgeConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LessonForgeConfig::default();
        assert_eq!(config.llm.provider, "anthropic");
        assert_eq!(config.image.max_attempts, 3);
        assert!(config.image.enabled);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_config_validation() {
        let config = LessonForgeConfig::default();
        assert!(ConfigManager::validate_config(&config).is_ok());

        let mut bad_config = config.clone();
        bad_config.llm.provider = "invalid".to_string();
        assert!(ConfigManager::validate_config(&bad_config).is_err());

        let mut bad_config = config.clone();
        bad_config.image.max_attempts = 0;
        assert!(ConfigManager::validate_config(&bad_config).is_err());
    }

    #[test]
    fn test_default_config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        ConfigManager::create_default_config(&path).unwrap();

        let loaded = ConfigManager::read_toml_file(&path).unwrap();
        assert_eq!(loaded.llm.max_tokens, LLMConfig::default().max_tokens);
        assert_eq!(loaded.image.primary_model, "gpt-image-1");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: LessonForgeConfig = toml::from_str(
            r#"
            [llm]
            provider = "openai"
            model = "gpt-4o"

            [image]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.llm.model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.llm.max_tokens, 2048);
        assert_eq!(config.image.max_attempts, 5);
        assert_eq!(config.image.secondary_model, "dall-e-3");
    }
}
