//! Relevance scoring of candidate items against a query
//!
//! Score composition (clamped to 0.0-1.0):
//! - user-selected items: fixed high score
//! - manual relevance: 70% manual, 30% similarity
//! - otherwise: similarity (60%), content type weight (20%), recency (10%),
//!   user interaction (10%)

use super::models::{CandidateItem, ScoringFactors};
use super::sources::SimilarityLookup;
use crate::config::ScoringConfig;
use crate::error::{ContextError, Result};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Computes 0-1 relevance scores; never fails a batch because of one item
pub struct RelevanceScorer {
    config: ScoringConfig,
    similarity: Option<Arc<dyn SimilarityLookup>>,
}

impl RelevanceScorer {
    /// Create a scorer without a similarity source (neutral similarity)
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            similarity: None,
        }
    }

    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityLookup>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score one item; failures yield the neutral score
    pub async fn score(&self, item: &CandidateItem, query: &str, factors: &ScoringFactors) -> f32 {
        match self.try_score(item, query, factors).await {
            Ok(score) => score,
            Err(e) => {
                warn!(
                    "Scoring failed for {}, using neutral score {}: {}",
                    item.id, self.config.neutral_score, e
                );
                if let Some(metrics) = crate::metrics::metrics() {
                    metrics.record_scoring_fallback();
                }
                self.config.neutral_score
            }
        }
    }

    /// Score items in fixed-size batches: concurrent within a batch,
    /// sequential across batches
    pub async fn batch_score(
        &self,
        items: &[CandidateItem],
        query: &str,
        factors: &ScoringFactors,
    ) -> HashMap<String, f32> {
        let mut scores = HashMap::with_capacity(items.len());

        for (batch_idx, batch) in items.chunks(self.config.batch_size.max(1)).enumerate() {
            let results = join_all(batch.iter().map(|item| self.score(item, query, factors))).await;
            for (item, score) in batch.iter().zip(results) {
                scores.insert(item.id.clone(), score);
            }
            debug!("Scored batch {} ({} items)", batch_idx, batch.len());
        }

        scores
    }

    async fn try_score(
        &self,
        item: &CandidateItem,
        query: &str,
        call_factors: &ScoringFactors,
    ) -> Result<f32> {
        let factors = item.factors.layered_over(call_factors);

        if factors.is_selected_by_user() {
            return Ok(self.config.user_selected_score);
        }

        let similarity = self.similarity(item, query).await?;

        if let Some(manual) = factors.manual_relevance {
            if !manual.is_finite() {
                return Err(ContextError::Internal(format!(
                    "non-finite manual relevance {} for {}",
                    manual, item.id
                )));
            }
            let blended = 0.7 * unit(manual) + 0.3 * similarity;
            return Ok(blended.clamp(0.0, 1.0));
        }

        let type_weight = factors
            .content_type_weights
            .as_ref()
            .and_then(|w| w.get(&item.content_type))
            .or_else(|| self.config.content_type_weights.get(&item.content_type))
            .copied()
            .unwrap_or(1.0);
        let recency = factors
            .recency
            .map(unit)
            .unwrap_or_else(|| self.derived_recency(item));
        let interaction = factors
            .user_interaction
            .map(unit)
            .unwrap_or(self.config.neutral_score);

        let score = similarity * 0.6 + type_weight * 0.2 + recency * 0.1 + interaction * 0.1;
        if !score.is_finite() {
            return Err(ContextError::Internal(format!(
                "non-finite score for {}",
                item.id
            )));
        }
        Ok(score.clamp(0.0, 1.0))
    }

    async fn similarity(&self, item: &CandidateItem, query: &str) -> Result<f32> {
        if let Some(precomputed) = item.relevance {
            return Ok(unit(precomputed));
        }

        let Some(lookup) = &self.similarity else {
            return Ok(self.config.neutral_score);
        };

        match lookup.score(&item.id, query).await? {
            Some(value) if value.is_finite() => Ok(unit(value)),
            Some(value) => Err(ContextError::Similarity(format!(
                "non-finite similarity {} for {}",
                value, item.id
            ))),
            None => Ok(self.config.neutral_score),
        }
    }

    /// Exponential decay on the item's age; neutral when no timestamp
    fn derived_recency(&self, item: &CandidateItem) -> f32 {
        let Some(updated_at) = item.updated_at else {
            return self.config.neutral_score;
        };
        let age_days = (Utc::now() - updated_at).num_seconds().max(0) as f64 / 86_400.0;
        0.5_f64.powf(age_days / self.config.recency_half_life_days) as f32
    }
}

fn unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::models::ContentType;
    use async_trait::async_trait;
    use chrono::Duration;

    struct FailingLookup;

    #[async_trait]
    impl SimilarityLookup for FailingLookup {
        async fn score(&self, _content_id: &str, _query: &str) -> Result<Option<f32>> {
            Err(ContextError::Similarity("vector store unavailable".into()))
        }
    }

    struct FixedLookup(f32);

    #[async_trait]
    impl SimilarityLookup for FixedLookup {
        async fn score(&self, _content_id: &str, _query: &str) -> Result<Option<f32>> {
            Ok(Some(self.0))
        }
    }

    fn text_item(id: &str) -> CandidateItem {
        CandidateItem::new(id, ContentType::Text, id).with_content("body")
    }

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[tokio::test]
    async fn test_user_selection_overrides() {
        let scorer = RelevanceScorer::new(ScoringConfig::default())
            .with_similarity(Arc::new(FixedLookup(0.0)));
        let item = text_item("a").selected_by_user();
        let score = scorer.score(&item, "q", &ScoringFactors::default()).await;
        assert!(approx(score, 0.9));
    }

    #[tokio::test]
    async fn test_manual_relevance_blend() {
        let scorer = RelevanceScorer::new(ScoringConfig::default())
            .with_similarity(Arc::new(FixedLookup(0.5)));
        let factors = ScoringFactors {
            manual_relevance: Some(1.0),
            ..Default::default()
        };
        let score = scorer.score(&text_item("a"), "q", &factors).await;
        assert!(approx(score, 0.85));
    }

    #[tokio::test]
    async fn test_weighted_sum_and_clamp() {
        let scorer = RelevanceScorer::new(ScoringConfig::default())
            .with_similarity(Arc::new(FixedLookup(1.0)));
        let factors = ScoringFactors {
            recency: Some(1.0),
            user_interaction: Some(1.0),
            ..Default::default()
        };

        let text = scorer.score(&text_item("a"), "q", &factors).await;
        assert!(approx(text, 1.0));

        // code weight 1.2 pushes the raw sum above 1.0
        let code = CandidateItem::new("c", ContentType::Code, "c").with_content("fn x() {}");
        assert!(approx(scorer.score(&code, "q", &factors).await, 1.0));
    }

    #[tokio::test]
    async fn test_content_type_weight_override() {
        let scorer = RelevanceScorer::new(ScoringConfig::default());
        let factors = ScoringFactors {
            recency: Some(0.0),
            user_interaction: Some(0.0),
            content_type_weights: Some(HashMap::from([(ContentType::Text, 0.0)])),
            ..Default::default()
        };
        // neutral similarity only: 0.5 * 0.6
        let score = scorer.score(&text_item("a"), "q", &factors).await;
        assert!(approx(score, 0.3));
    }

    #[tokio::test]
    async fn test_failing_lookup_is_neutral_and_stable() {
        let scorer = RelevanceScorer::new(ScoringConfig::default())
            .with_similarity(Arc::new(FailingLookup));
        let item = text_item("a");
        let first = scorer.score(&item, "q", &ScoringFactors::default()).await;
        let second = scorer.score(&item, "q", &ScoringFactors::default()).await;
        assert_eq!(first, 0.5);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_non_finite_manual_relevance_is_neutral() {
        let scorer = RelevanceScorer::new(ScoringConfig::default())
            .with_similarity(Arc::new(FixedLookup(1.0)));
        for manual in [f32::NAN, f32::INFINITY] {
            let factors = ScoringFactors {
                manual_relevance: Some(manual),
                ..Default::default()
            };
            assert_eq!(scorer.score(&text_item("a"), "q", &factors).await, 0.5);
        }
    }

    #[tokio::test]
    async fn test_precomputed_relevance_skips_lookup() {
        let scorer = RelevanceScorer::new(ScoringConfig::default())
            .with_similarity(Arc::new(FailingLookup));
        let item = text_item("a").with_relevance(1.0);
        let factors = ScoringFactors {
            recency: Some(0.0),
            user_interaction: Some(0.0),
            ..Default::default()
        };
        assert!(approx(scorer.score(&item, "q", &factors).await, 0.8));
    }

    #[tokio::test]
    async fn test_recency_decays_with_age() {
        let scorer = RelevanceScorer::new(ScoringConfig::default());
        let fresh = text_item("a").with_updated_at(Utc::now());
        let stale = text_item("b").with_updated_at(Utc::now() - Duration::days(60));
        assert!(scorer.derived_recency(&fresh) > 0.99);
        assert!((scorer.derived_recency(&stale) - 0.25).abs() < 0.01);
        assert_eq!(scorer.derived_recency(&text_item("c")), 0.5);
    }

    #[tokio::test]
    async fn test_batch_score_covers_all_items() {
        let config = ScoringConfig {
            batch_size: 3,
            ..Default::default()
        };
        let scorer = RelevanceScorer::new(config).with_similarity(Arc::new(FailingLookup));
        let items: Vec<_> = (0..7).map(|i| text_item(&format!("item-{}", i))).collect();

        let scores = scorer.batch_score(&items, "q", &ScoringFactors::default()).await;
        assert_eq!(scores.len(), 7);
        assert!(scores.values().all(|&s| s == 0.5));
    }
}
