//! Layered configuration: built-in defaults, an optional TOML file, then
//! `CONTEXT_OPTIMIZER__<SECTION>__<FIELD>` environment variables.

use crate::context::models::ContentType;
use crate::context::optimizer::OptimizeOptions;
use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing_subscriber::EnvFilter;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CONTEXT_OPTIMIZER";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub optimizer: OptimizeOptions,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub tokenizer: TokenizerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        // A missing .env file is not an error
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate that the configuration is consistent
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        self.scoring.validate()?;
        self.compression.validate()?;
        if self.tokenizer.tokens_per_word <= 0.0 {
            return Err(ContextError::Configuration(
                "tokenizer.tokens_per_word must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relevance scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Items scored concurrently per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Score used when similarity or scoring fails
    #[serde(default = "default_neutral_score")]
    pub neutral_score: f32,

    /// Score given to items the user explicitly selected
    #[serde(default = "default_user_selected_score")]
    pub user_selected_score: f32,

    /// Default weight per content type
    #[serde(default = "default_content_type_weights")]
    pub content_type_weights: HashMap<ContentType, f32>,

    /// Half-life used to derive recency from `updated_at`
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,
}

fn default_batch_size() -> usize {
    20
}

fn default_neutral_score() -> f32 {
    0.5
}

fn default_user_selected_score() -> f32 {
    0.9
}

fn default_content_type_weights() -> HashMap<ContentType, f32> {
    HashMap::from([
        (ContentType::Text, 1.0),
        (ContentType::Code, 1.2),
        (ContentType::Image, 0.7),
        (ContentType::List, 1.0),
    ])
}

fn default_recency_half_life_days() -> f64 {
    30.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            neutral_score: default_neutral_score(),
            user_selected_score: default_user_selected_score(),
            content_type_weights: default_content_type_weights(),
            recency_half_life_days: default_recency_half_life_days(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ContextError::Configuration(
                "scoring.batch_size must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("neutral_score", self.neutral_score),
            ("user_selected_score", self.user_selected_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ContextError::Configuration(format!(
                    "scoring.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.recency_half_life_days <= 0.0 {
            return Err(ContextError::Configuration(
                "scoring.recency_half_life_days must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Emergency compression configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Items at or above this relevance are never compressed
    #[serde(default = "default_keep_relevance")]
    pub keep_relevance: f32,

    /// Code longer than this (in chars) has bodies elided
    #[serde(default = "default_code_elision_chars")]
    pub code_elision_chars: usize,

    /// Compression target as a fraction of available tokens
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f32,

    /// Phrases marking a paragraph worth keeping
    #[serde(default = "default_signal_phrases")]
    pub signal_phrases: Vec<String>,
}

fn default_keep_relevance() -> f32 {
    0.5
}

fn default_code_elision_chars() -> usize {
    1000
}

fn default_target_ratio() -> f32 {
    0.7
}

fn default_signal_phrases() -> Vec<String> {
    [
        "important",
        "key",
        "critical",
        "essential",
        "significant",
        "must",
        "note",
        "conclusion",
        "in summary",
        "summary",
        "therefore",
        "result",
        "finding",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            keep_relevance: default_keep_relevance(),
            code_elision_chars: default_code_elision_chars(),
            target_ratio: default_target_ratio(),
            signal_phrases: default_signal_phrases(),
        }
    }
}

impl CompressionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.keep_relevance) {
            return Err(ContextError::Configuration(format!(
                "compression.keep_relevance must be within [0, 1], got {}",
                self.keep_relevance
            )));
        }
        if !(self.target_ratio > 0.0 && self.target_ratio <= 1.0) {
            return Err(ContextError::Configuration(format!(
                "compression.target_ratio must be within (0, 1], got {}",
                self.target_ratio
            )));
        }
        Ok(())
    }
}

/// Tokenizer backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Tiktoken,
    Word,
}

/// Tokenizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    #[serde(default = "default_tokenizer_kind")]
    pub kind: TokenizerKind,

    /// Used by the word-based estimator
    #[serde(default = "default_tokens_per_word")]
    pub tokens_per_word: f64,

    /// Bytes of text whose token counts are cached; 0 disables caching
    #[serde(default = "default_cache_capacity_bytes")]
    pub cache_capacity_bytes: u64,
}

fn default_tokenizer_kind() -> TokenizerKind {
    TokenizerKind::Tiktoken
}

fn default_tokens_per_word() -> f64 {
    1.3
}

fn default_cache_capacity_bytes() -> u64 {
    16 * 1024 * 1024
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            kind: default_tokenizer_kind(),
            tokens_per_word: default_tokens_per_word(),
            cache_capacity_bytes: default_cache_capacity_bytes(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ContextError::Configuration(format!("invalid log level: {}", e)))?;

    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    result.map_err(|e| ContextError::Configuration(format!("tracing already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer.reserve_tokens, 800);
        assert_eq!(config.scoring.batch_size, 20);
        assert_eq!(config.compression.keep_relevance, 0.5);
        assert_eq!(config.tokenizer.kind, TokenizerKind::Tiktoken);
    }

    #[test]
    fn test_default_content_type_weights() {
        let weights = ScoringConfig::default().content_type_weights;
        assert_eq!(weights[&ContentType::Text], 1.0);
        assert_eq!(weights[&ContentType::Code], 1.2);
        assert_eq!(weights[&ContentType::Image], 0.7);
    }

    #[test]
    fn test_from_toml_overrides_sections() {
        let toml = r#"
            [optimizer]
            reserve_tokens = 200
            max_chunk_tokens = 500

            [scoring]
            batch_size = 5

            [tokenizer]
            kind = "word"
            tokens_per_word = 1.0

            [logging]
            level = "debug"
            json = true
        "#;

        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.optimizer.reserve_tokens, 200);
        assert_eq!(config.optimizer.max_chunk_tokens, 500);
        assert_eq!(config.optimizer.max_content_items, 50);
        assert_eq!(config.scoring.batch_size, 5);
        assert_eq!(config.scoring.neutral_score, 0.5);
        assert_eq!(config.tokenizer.kind, TokenizerKind::Word);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let toml = r#"
            [scoring]
            batch_size = 0
        "#;
        assert!(matches!(
            Config::from_toml_str(toml),
            Err(ContextError::Configuration(_))
        ));

        let toml = r#"
            [optimizer]
            relevance_threshold = 1.5
        "#;
        assert!(Config::from_toml_str(toml).is_err());
    }
}
