//! Token estimation using tiktoken

use crate::config::{TokenizerConfig, TokenizerKind};
use crate::error::{ContextError, Result};
use moka::sync::Cache;
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Token estimator trait for different tokenization strategies
///
/// Implementations must be deterministic: the same text always yields the
/// same count.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Fallible estimation for tokenizers backed by external resources
    fn try_estimate(&self, text: &str) -> Result<usize> {
        Ok(self.estimate(text))
    }

}

/// Tiktoken-based token estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base().map_err(|e| ContextError::Tokenizer(e.to_string()))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Word-based token estimator (fallback, ~1.3 tokens per word)
#[derive(Debug, Clone, Copy)]
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Memoizing decorator over another estimator
///
/// Capacity is measured in bytes of cached text, so a few large spans cannot
/// pin an unbounded amount of memory. Only successful counts are cached, so a
/// transient tokenizer failure is retried on the next call.
pub struct CachedEstimator {
    inner: Arc<dyn TokenEstimator>,
    cache: Cache<String, usize>,
}

impl CachedEstimator {
    pub fn new(inner: Arc<dyn TokenEstimator>, capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|text: &String, _tokens: &usize| -> u32 {
                text.len().try_into().unwrap_or(u32::MAX)
            })
            .build();
        Self { inner, cache }
    }

    pub fn cached_entries(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    /// Bytes of text currently held by the cache
    pub fn cached_bytes(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

impl TokenEstimator for CachedEstimator {
    fn estimate(&self, text: &str) -> usize {
        if let Some(hit) = self.cache.get(text) {
            return hit;
        }
        let tokens = self.inner.estimate(text);
        self.cache.insert(text.to_string(), tokens);
        tokens
    }

    fn try_estimate(&self, text: &str) -> Result<usize> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }
        let tokens = self.inner.try_estimate(text)?;
        self.cache.insert(text.to_string(), tokens);
        Ok(tokens)
    }
}

/// Build the estimator described by the tokenizer configuration
pub fn build_estimator(config: &TokenizerConfig) -> Result<Arc<dyn TokenEstimator>> {
    let base: Arc<dyn TokenEstimator> = match config.kind {
        TokenizerKind::Tiktoken => Arc::new(TiktokenEstimator::new()?),
        TokenizerKind::Word => Arc::new(WordBasedEstimator::new(config.tokens_per_word)),
    };

    if config.cache_capacity_bytes == 0 {
        return Ok(base);
    }
    Ok(Arc::new(CachedEstimator::new(base, config.cache_capacity_bytes)))
}
