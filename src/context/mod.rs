//! Context optimization with token budget enforcement
//!
//! Turns a flat list of candidate items into an ordered, token-accounted
//! selection that fits a hard budget: relevance scoring, greedy selection,
//! content-aware chunking and emergency compression.

pub mod chunker;
pub mod compressor;
pub mod models;
pub mod optimizer;
pub mod relevance;
pub mod sources;
pub mod token_budget;
pub mod token_estimator;

pub use chunker::{ChunkStrategy, Chunker};
pub use compressor::Compressor;
pub use models::{
    CandidateItem, ContentChunk, ContentType, OptimizedContentItem, OptimizedContext,
    ScoringFactors,
};
pub use optimizer::{ContextOptimizer, OptimizeOptions};
pub use relevance::RelevanceScorer;
pub use sources::{
    ContentLoader, InMemoryContentLoader, KeywordSimilarity, LoadedContent, SimilarityLookup,
};
pub use token_budget::{BudgetAllocation, BudgetError, TokenBudget};
pub use token_estimator::{CachedEstimator, TiktokenEstimator, TokenEstimator, WordBasedEstimator};
