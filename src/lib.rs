//! Budget-constrained context assembly for LLM prompts
//!
//! Given candidate content items, a query and a token budget, the
//! [`ContextOptimizer`](context::ContextOptimizer) scores, ranks, chunks and
//! (when needed) compresses content so the selection always fits the budget
//! minus the tokens reserved for the query and the response.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;

pub use error::{ContextError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::{Config, LoggingConfig};
    pub use crate::context::{
        CandidateItem, ChunkStrategy, Chunker, Compressor, ContentChunk, ContentLoader,
        ContentType, ContextOptimizer, OptimizeOptions, OptimizedContentItem, OptimizedContext,
        RelevanceScorer, ScoringFactors, SimilarityLookup, TokenBudget, TokenEstimator,
    };
    pub use crate::error::{ContextError, Result};
}
