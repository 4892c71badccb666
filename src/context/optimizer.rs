//! Context optimizer with token budget enforcement
//!
//! Implements budget-constrained context selection with:
//! - Relevance ranking (user selections first)
//! - Greedy selection under the available token budget
//! - Content-aware chunking of oversized items
//! - One emergency compression pass when the budget runs tight

use super::chunker::{ChunkStrategy, Chunker};
use super::compressor::Compressor;
use super::models::{
    CandidateItem, ContentType, OptimizedContentItem, OptimizedContext, ScoringFactors,
};
use super::relevance::RelevanceScorer;
use super::sources::{ContentLoader, SimilarityLookup};
use super::token_budget::TokenBudget;
use super::token_estimator::{build_estimator, TokenEstimator, WordBasedEstimator};
use crate::config::{CompressionConfig, Config, ScoringConfig};
use crate::error::{ContextError, Result};
use crate::metrics::metrics;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-call optimization options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeOptions {
    /// Tokens held back for the query and the response
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,

    #[serde(default = "default_max_content_items")]
    pub max_content_items: usize,

    /// Candidates scoring below this are dropped
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    /// Items above this size are chunked
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,

    #[serde(default = "default_enable_compression")]
    pub enable_compression: bool,

    /// Usage above which compression may run; defaults to 70% of the budget
    #[serde(default)]
    pub compression_threshold: Option<usize>,

    /// Use list-aware chunking for text
    #[serde(default)]
    pub list_aware: bool,

    /// Call-level scoring factors
    #[serde(default)]
    pub factors: ScoringFactors,
}

fn default_reserve_tokens() -> usize {
    800
}

fn default_max_content_items() -> usize {
    50
}

fn default_relevance_threshold() -> f32 {
    0.1
}

fn default_max_chunk_tokens() -> usize {
    1000
}

fn default_enable_compression() -> bool {
    true
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            reserve_tokens: default_reserve_tokens(),
            max_content_items: default_max_content_items(),
            relevance_threshold: default_relevance_threshold(),
            max_chunk_tokens: default_max_chunk_tokens(),
            enable_compression: default_enable_compression(),
            compression_threshold: None,
            list_aware: false,
            factors: ScoringFactors::default(),
        }
    }
}

impl OptimizeOptions {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.relevance_threshold) {
            return Err(ContextError::Configuration(format!(
                "relevance_threshold must be within [0, 1], got {}",
                self.relevance_threshold
            )));
        }
        if self.max_chunk_tokens == 0 {
            return Err(ContextError::Configuration(
                "max_chunk_tokens must be at least 1".to_string(),
            ));
        }
        if self.max_content_items == 0 {
            return Err(ContextError::Configuration(
                "max_content_items must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn budget_for(&self, budget: usize, target_ratio: f32) -> TokenBudget {
        let plan =
            TokenBudget::new(budget, self.reserve_tokens).with_compression_ratio(target_ratio);
        match self.compression_threshold {
            Some(threshold) => plan.with_compression_threshold(threshold),
            None => plan,
        }
    }
}

/// Ranked candidate
struct Ranked<'a> {
    item: &'a CandidateItem,
    score: f32,
    selected: bool,
}

/// Resolved text and presentation fields of a candidate
struct Resolved {
    text: String,
    title: String,
    content_type: ContentType,
    metadata: HashMap<String, String>,
}

/// Working set of one optimization call
struct Selection<'a> {
    items: Vec<OptimizedContentItem>,
    used: usize,
    budget: TokenBudget,
    compressor: Option<&'a Compressor>,
    compressed: bool,
}

impl<'a> Selection<'a> {
    fn len(&self) -> usize {
        self.items.len()
    }

    /// Append if the item fits, compressing once when usage is high
    fn try_append(&mut self, item: OptimizedContentItem) -> bool {
        if self.budget.fits(self.used, item.tokens) {
            self.push(item);
            return true;
        }

        let Some(compressor) = self.compressor else {
            return false;
        };
        if self.compressed || !self.budget.should_compress(self.used) {
            return false;
        }

        self.compressed = true;
        let before = self.used;
        let items = std::mem::take(&mut self.items);
        self.items = compressor.compress(items, self.budget.compression_target());
        self.used = self.items.iter().map(|i| i.tokens).sum();
        if let Some(m) = metrics() {
            m.record_compression();
        }
        info!(
            "Compression reclaimed {} tokens ({} -> {})",
            before - self.used,
            before,
            self.used
        );

        if self.budget.fits(self.used, item.tokens) {
            self.push(item);
            return true;
        }
        false
    }

    fn push(&mut self, item: OptimizedContentItem) {
        self.used += item.tokens;
        self.items.push(item);
    }
}

/// Assembles a token-bounded context from candidate items
pub struct ContextOptimizer {
    estimator: Arc<dyn TokenEstimator>,
    fallback_estimator: WordBasedEstimator,
    scorer: RelevanceScorer,
    chunker: Chunker,
    compressor: Compressor,
    loader: Option<Arc<dyn ContentLoader>>,
}

impl ContextOptimizer {
    /// Create an optimizer around an explicit tokenizer
    pub fn new(
        estimator: Arc<dyn TokenEstimator>,
        scoring: ScoringConfig,
        compression: CompressionConfig,
    ) -> Self {
        Self {
            scorer: RelevanceScorer::new(scoring),
            chunker: Chunker::new(estimator.clone()),
            compressor: Compressor::new(estimator.clone(), compression),
            fallback_estimator: WordBasedEstimator::default(),
            estimator,
            loader: None,
        }
    }

    /// Create from configuration, building the configured tokenizer
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let estimator = build_estimator(&config.tokenizer)?;
        Ok(Self::new(
            estimator,
            config.scoring.clone(),
            config.compression.clone(),
        ))
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityLookup>) -> Self {
        self.scorer =
            RelevanceScorer::new(self.scorer.config().clone()).with_similarity(similarity);
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ContentLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn scorer(&self) -> &RelevanceScorer {
        &self.scorer
    }

    pub fn chunker(&self) -> &Chunker {
        &self.chunker
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    /// Select candidates for `query` within `budget` tokens
    pub async fn optimize(
        &self,
        candidates: &[CandidateItem],
        query: &str,
        budget: usize,
        options: &OptimizeOptions,
    ) -> Result<OptimizedContext> {
        options.validate()?;
        self.validate_candidates(candidates)?;

        let plan = options.budget_for(budget, self.compressor.config().target_ratio);
        if let Err(e) = plan.check_satisfiable() {
            warn!("{}, returning empty context", e);
            if let Some(m) = metrics() {
                m.record_optimization("unsatisfiable", 0, 0);
            }
            return Ok(OptimizedContext::empty(query, candidates.len(), 0));
        }
        let available = plan.available();

        let scores = self
            .scorer
            .batch_score(candidates, query, &options.factors)
            .await;
        let ranked = rank(candidates, &scores, options);
        let eligible = ranked.len();
        debug!(
            "{} of {} candidates pass relevance threshold {}",
            eligible,
            candidates.len(),
            options.relevance_threshold
        );

        let mut selection = Selection {
            items: Vec::new(),
            used: 0,
            budget: plan,
            compressor: options.enable_compression.then_some(&self.compressor),
            compressed: false,
        };

        'candidates: for candidate in ranked {
            if selection.len() >= options.max_content_items {
                debug!("Reached max content items ({})", options.max_content_items);
                break;
            }

            let Some(resolved) = self.resolve(candidate.item).await else {
                record_skip("load_failed");
                continue;
            };
            if resolved.text.trim().is_empty() {
                debug!("Skipping {}: empty content", candidate.item.id);
                record_skip("empty");
                continue;
            }

            let tokens = match candidate.item.tokens {
                Some(tokens) => tokens,
                None => self.count_tokens(&candidate.item.id, &resolved.text),
            };

            if tokens <= options.max_chunk_tokens {
                let item = OptimizedContentItem {
                    id: candidate.item.id.clone(),
                    content: resolved.text,
                    title: resolved.title,
                    content_type: resolved.content_type,
                    tokens,
                    relevance: candidate.score,
                    chunk_index: None,
                    metadata: resolved.metadata,
                };
                if !selection.try_append(item) {
                    debug!(
                        "Skipping {} ({} tokens): exceeds remaining budget",
                        candidate.item.id, tokens
                    );
                    record_skip("over_budget");
                }
                continue;
            }

            let strategy =
                ChunkStrategy::for_content_type(resolved.content_type, options.list_aware);
            let chunks = match self
                .chunker
                .chunk_with(strategy, &resolved.text, options.max_chunk_tokens)
            {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("Skipping {}: chunking failed: {}", candidate.item.id, e);
                    record_skip("chunking_failed");
                    continue;
                }
            };
            if let Some(m) = metrics() {
                m.record_chunked();
            }
            debug!(
                "Split {} ({} tokens) into {} chunks with {:?}",
                candidate.item.id,
                tokens,
                chunks.len(),
                strategy
            );

            let chunk_count = chunks.len();
            for (idx, chunk) in chunks.into_iter().enumerate() {
                if selection.len() >= options.max_content_items {
                    debug!("Reached max content items ({})", options.max_content_items);
                    break 'candidates;
                }
                let mut metadata = resolved.metadata.clone();
                metadata.insert("chunk_start".to_string(), chunk.start_index.to_string());
                metadata.insert("chunk_end".to_string(), chunk.end_index.to_string());
                metadata.insert("chunk_count".to_string(), chunk_count.to_string());

                let chunk_tokens = chunk.tokens;
                let item = OptimizedContentItem {
                    id: candidate.item.id.clone(),
                    content: chunk.content,
                    title: resolved.title.clone(),
                    content_type: resolved.content_type,
                    tokens: chunk_tokens,
                    relevance: candidate.score,
                    chunk_index: Some(idx),
                    metadata,
                };
                if !selection.try_append(item) {
                    debug!(
                        "Skipping chunk {} of {} ({} tokens): exceeds remaining budget",
                        idx, candidate.item.id, chunk_tokens
                    );
                    record_skip("over_budget");
                }
            }
        }

        debug_assert!(
            selection.budget.check_budget(selection.used).is_ok(),
            "selection of {} tokens exceeds {} available",
            selection.used,
            available
        );
        let total_tokens = selection.used;
        let remaining_tokens = available - total_tokens;
        let items = selection.items;

        info!(
            "Optimized context: {} of {} candidates eligible -> {} items, {} tokens ({} remaining)",
            eligible,
            candidates.len(),
            items.len(),
            total_tokens,
            remaining_tokens
        );
        if let Some(m) = metrics() {
            let outcome = if items.is_empty() { "empty" } else { "selected" };
            m.record_optimization(outcome, total_tokens, remaining_tokens);
        }

        Ok(OptimizedContext {
            selected_content_count: items.len(),
            items,
            total_tokens,
            remaining_tokens,
            original_content_count: candidates.len(),
            query: query.to_string(),
        })
    }

    fn validate_candidates(&self, candidates: &[CandidateItem]) -> Result<()> {
        let mut seen = HashSet::with_capacity(candidates.len());
        for item in candidates {
            if item.id.trim().is_empty() {
                return Err(ContextError::InvalidInput(
                    "candidate with empty id".to_string(),
                ));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(ContextError::InvalidInput(format!(
                    "duplicate candidate id {}",
                    item.id
                )));
            }
            if let Some(relevance) = item.relevance {
                if !(0.0..=1.0).contains(&relevance) {
                    return Err(ContextError::InvalidInput(format!(
                        "candidate {} has relevance {} outside [0, 1]",
                        item.id, relevance
                    )));
                }
            }
            if item.raw_content.is_none() && self.loader.is_none() {
                return Err(ContextError::InvalidInput(format!(
                    "candidate {} has no content and no loader is configured",
                    item.id
                )));
            }
        }
        Ok(())
    }

    async fn resolve(&self, item: &CandidateItem) -> Option<Resolved> {
        if let Some(text) = &item.raw_content {
            return Some(Resolved {
                text: text.clone(),
                title: item.title.clone(),
                content_type: item.content_type,
                metadata: item.metadata.clone(),
            });
        }

        let loader = self.loader.as_ref()?;
        match loader.load(&item.id).await {
            Ok(loaded) => {
                let mut metadata = loaded.metadata;
                metadata.extend(item.metadata.clone());
                let title = if item.title.is_empty() {
                    loaded.title
                } else {
                    item.title.clone()
                };
                Some(Resolved {
                    text: loaded.text,
                    title,
                    content_type: item.content_type,
                    metadata,
                })
            }
            Err(e) => {
                warn!("Skipping {}: {}", item.id, e);
                None
            }
        }
    }

    /// Token count with the word-based estimate as fallback
    fn count_tokens(&self, id: &str, text: &str) -> usize {
        match self.estimator.try_estimate(text) {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Token count failed for {}, using word estimate: {}", id, e);
                self.fallback_estimator.estimate(text)
            }
        }
    }
}

/// Filter by threshold and order: user selections first (in input order),
/// then by descending score
fn rank<'a>(
    candidates: &'a [CandidateItem],
    scores: &HashMap<String, f32>,
    options: &OptimizeOptions,
) -> Vec<Ranked<'a>> {
    let mut ranked: Vec<Ranked<'a>> = candidates
        .iter()
        .map(|item| Ranked {
            item,
            score: scores.get(&item.id).copied().unwrap_or(0.0),
            selected: item
                .factors
                .layered_over(&options.factors)
                .is_selected_by_user(),
        })
        .filter(|r| r.selected || r.score >= options.relevance_threshold)
        .collect();

    ranked.sort_by(|a, b| match (a.selected, b.selected) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => b.score.total_cmp(&a.score),
    });
    ranked
}

fn record_skip(reason: &str) {
    if let Some(m) = metrics() {
        m.record_skip(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::sources::InMemoryContentLoader;

    struct FlakyEstimator;

    impl TokenEstimator for FlakyEstimator {
        fn estimate(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }

        fn try_estimate(&self, _text: &str) -> Result<usize> {
            Err(ContextError::Tokenizer("tokenizer offline".into()))
        }
    }

    fn optimizer() -> ContextOptimizer {
        ContextOptimizer::new(
            Arc::new(WordBasedEstimator::new(1.0)),
            ScoringConfig::default(),
            CompressionConfig::default(),
        )
    }

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    fn options(reserve: usize) -> OptimizeOptions {
        OptimizeOptions {
            reserve_tokens: reserve,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_options() {
        let options = OptimizeOptions::default();
        assert_eq!(options.reserve_tokens, 800);
        assert_eq!(options.max_content_items, 50);
        assert_eq!(options.relevance_threshold, 0.1);
        assert_eq!(options.max_chunk_tokens, 1000);
        assert!(options.enable_compression);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_default_compression_threshold_is_70_percent_of_budget() {
        let plan = OptimizeOptions::default().budget_for(2000, 0.7);
        assert_eq!(plan.compression_threshold(), 1400);
    }

    #[tokio::test]
    async fn test_budget_below_reserve_returns_empty() {
        let items = vec![CandidateItem::new("a", ContentType::Text, "A").with_content("hello")];
        let ctx = optimizer()
            .optimize(&items, "q", 500, &options(800))
            .await
            .unwrap();
        assert!(ctx.is_empty());
        assert_eq!(ctx.total_tokens, 0);
        assert_eq!(ctx.remaining_tokens, 0);
        assert_eq!(ctx.original_content_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_candidates_rejected() {
        let opt = optimizer();

        let no_content = vec![CandidateItem::new("a", ContentType::Text, "A")];
        assert!(matches!(
            opt.optimize(&no_content, "q", 1000, &options(0)).await,
            Err(ContextError::InvalidInput(_))
        ));

        let duplicate = vec![
            CandidateItem::new("a", ContentType::Text, "A").with_content("x"),
            CandidateItem::new("a", ContentType::Text, "A").with_content("y"),
        ];
        assert!(opt.optimize(&duplicate, "q", 1000, &options(0)).await.is_err());

        let bad_relevance =
            vec![CandidateItem::new("a", ContentType::Text, "A")
                .with_content("x")
                .with_relevance(f32::NAN)];
        assert!(opt.optimize(&bad_relevance, "q", 1000, &options(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let items = vec![CandidateItem::new("a", ContentType::Text, "A").with_content("x")];
        let opts = OptimizeOptions {
            max_chunk_tokens: 0,
            ..Default::default()
        };
        assert!(matches!(
            optimizer().optimize(&items, "q", 1000, &opts).await,
            Err(ContextError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_threshold_filters_low_scores() {
        let factors = ScoringFactors {
            recency: Some(0.0),
            user_interaction: Some(0.0),
            content_type_weights: Some(HashMap::from([(ContentType::Text, 0.0)])),
            ..Default::default()
        };
        let items = vec![
            CandidateItem::new("low", ContentType::Text, "Low")
                .with_content("low words")
                .with_relevance(0.1),
            CandidateItem::new("high", ContentType::Text, "High")
                .with_content("high words")
                .with_relevance(0.9),
        ];
        let opts = OptimizeOptions {
            reserve_tokens: 0,
            relevance_threshold: 0.2,
            factors,
            ..Default::default()
        };

        let ctx = optimizer().optimize(&items, "q", 100, &opts).await.unwrap();
        let ids: Vec<_> = ctx.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["high"]);
    }

    #[tokio::test]
    async fn test_nan_manual_relevance_keeps_item_at_neutral_score() {
        let factors = ScoringFactors {
            manual_relevance: Some(f32::NAN),
            ..Default::default()
        };
        let items = vec![CandidateItem::new("a", ContentType::Text, "A")
            .with_content("some words")
            .with_factors(factors)];

        let ctx = optimizer().optimize(&items, "q", 100, &options(0)).await.unwrap();
        assert_eq!(ctx.items.len(), 1);
        assert_eq!(ctx.items[0].relevance, 0.5);
    }

    #[tokio::test]
    async fn test_loader_resolves_missing_content() {
        let loader = InMemoryContentLoader::new().with_text(
            "doc",
            ContentType::Text,
            "Loaded title",
            "loaded body text",
        );
        let opt = optimizer().with_loader(Arc::new(loader));
        let items = vec![
            CandidateItem::new("doc", ContentType::Text, ""),
            CandidateItem::new("missing", ContentType::Text, "Missing"),
        ];

        let ctx = opt.optimize(&items, "q", 100, &options(0)).await.unwrap();
        assert_eq!(ctx.items.len(), 1);
        assert_eq!(ctx.items[0].title, "Loaded title");
        assert_eq!(ctx.items[0].content, "loaded body text");
        assert_eq!(ctx.items[0].tokens, 3);
        assert_eq!(ctx.original_content_count, 2);
    }

    #[tokio::test]
    async fn test_max_items_stops_selection() {
        let items: Vec<_> = (0..5)
            .map(|i| {
                CandidateItem::new(format!("i{}", i), ContentType::Text, "t").with_content("a b")
            })
            .collect();
        let opts = OptimizeOptions {
            reserve_tokens: 0,
            max_content_items: 3,
            ..Default::default()
        };
        let ctx = optimizer().optimize(&items, "q", 1000, &opts).await.unwrap();
        assert_eq!(ctx.selected_content_count, 3);
        assert_eq!(ctx.total_tokens, 6);
    }

    #[tokio::test]
    async fn test_max_items_counts_chunks() {
        let items =
            vec![CandidateItem::new("big", ContentType::Text, "Big").with_content(words(50))];
        let opts = OptimizeOptions {
            reserve_tokens: 0,
            max_chunk_tokens: 10,
            max_content_items: 2,
            ..Default::default()
        };
        let ctx = optimizer().optimize(&items, "q", 1000, &opts).await.unwrap();
        assert_eq!(ctx.items.len(), 2);
        assert_eq!(ctx.items[0].chunk_index, Some(0));
        assert_eq!(ctx.items[1].chunk_index, Some(1));
    }

    #[tokio::test]
    async fn test_chunks_skipped_individually() {
        let text = format!("{}\n\n{}\n\n{}", words(8), words(3), words(8));
        let items = vec![CandidateItem::new("doc", ContentType::Text, "Doc").with_content(text)];
        let opts = OptimizeOptions {
            reserve_tokens: 0,
            max_chunk_tokens: 8,
            enable_compression: false,
            ..Default::default()
        };
        // chunks: 8, 3, 8 -> 8 fits, 3 fits, last 8 does not
        let ctx = optimizer().optimize(&items, "q", 12, &opts).await.unwrap();
        assert_eq!(ctx.items.len(), 2);
        assert_eq!(ctx.total_tokens, 11);
        assert_eq!(ctx.remaining_tokens, 1);
        assert_eq!(ctx.items[1].metadata["chunk_count"], "3");
    }

    #[tokio::test]
    async fn test_tokenizer_failure_falls_back_to_word_estimate() {
        let opt = ContextOptimizer::new(
            Arc::new(FlakyEstimator),
            ScoringConfig::default(),
            CompressionConfig::default(),
        );
        let items =
            vec![CandidateItem::new("a", ContentType::Text, "A").with_content("one two three")];
        let ctx = opt.optimize(&items, "q", 100, &options(0)).await.unwrap();
        assert_eq!(ctx.items.len(), 1);
        assert_eq!(ctx.items[0].tokens, 4); // 3 words * 1.3
    }

    #[tokio::test]
    async fn test_unchunkable_item_is_skipped() {
        let opt = ContextOptimizer::new(
            Arc::new(FlakyEstimator),
            ScoringConfig::default(),
            CompressionConfig::default(),
        );
        let items = vec![
            CandidateItem::new("big", ContentType::Text, "Big").with_content(words(40)),
            CandidateItem::new("small", ContentType::Text, "Small").with_content("tiny"),
        ];
        let opts = OptimizeOptions {
            reserve_tokens: 0,
            max_chunk_tokens: 10,
            ..Default::default()
        };
        let ctx = opt.optimize(&items, "q", 1000, &opts).await.unwrap();
        let ids: Vec<_> = ctx.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["small"]);
    }
}
