//! Error types for context optimization

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, ContextError>;

/// Context optimization errors
///
/// Only `InvalidInput` and `Configuration` are surfaced by
/// [`ContextOptimizer::optimize`](crate::context::ContextOptimizer::optimize);
/// the remaining variants are produced by collaborators and absorbed per item.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error("Content loading failed for {id}: {reason}")]
    Loader { id: String, reason: String },

    #[error("Similarity lookup failed: {0}")]
    Similarity(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<config::ConfigError> for ContextError {
    fn from(err: config::ConfigError) -> Self {
        ContextError::Configuration(err.to_string())
    }
}

impl ContextError {
    /// Whether this error must be propagated to the caller rather than absorbed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ContextError::InvalidInput(_) | ContextError::Configuration(_)
        )
    }
}
