//! External collaborators: similarity lookup and content loading

use super::models::{CandidateItem, ContentType};
use crate::error::{ContextError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Similarity signal between stored content and a query
///
/// `Ok(None)` means no signal is available for this item; the scorer
/// substitutes a neutral value.
#[async_trait]
pub trait SimilarityLookup: Send + Sync {
    async fn score(&self, content_id: &str, query: &str) -> Result<Option<f32>>;
}

/// Content resolved by a [`ContentLoader`]
#[derive(Debug, Clone)]
pub struct LoadedContent {
    pub text: String,
    pub content_type: ContentType,
    pub title: String,
    pub metadata: HashMap<String, String>,
}

/// Loads the full text of items whose content was not attached
#[async_trait]
pub trait ContentLoader: Send + Sync {
    async fn load(&self, content_id: &str) -> Result<LoadedContent>;
}

/// Content loader over an in-memory map
#[derive(Debug, Clone, Default)]
pub struct InMemoryContentLoader {
    entries: HashMap<String, LoadedContent>,
}

impl InMemoryContentLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, content: LoadedContent) {
        self.entries.insert(id.into(), content);
    }

    pub fn with_text(
        mut self,
        id: impl Into<String>,
        content_type: ContentType,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        self.insert(
            id,
            LoadedContent {
                text: text.into(),
                content_type,
                title: title.into(),
                metadata: HashMap::new(),
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ContentLoader for InMemoryContentLoader {
    async fn load(&self, content_id: &str) -> Result<LoadedContent> {
        self.entries
            .get(content_id)
            .cloned()
            .ok_or_else(|| ContextError::Loader {
                id: content_id.to_string(),
                reason: "not found".to_string(),
            })
    }
}

/// Query-term overlap similarity for deployments without a vector store
///
/// Score is the fraction of distinct query terms that occur in the item text.
#[derive(Debug, Clone, Default)]
pub struct KeywordSimilarity {
    terms: HashMap<String, HashSet<String>>,
}

impl KeywordSimilarity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every candidate with attached content
    pub fn from_items(items: &[CandidateItem]) -> Self {
        let mut similarity = Self::new();
        for item in items {
            if let Some(text) = &item.raw_content {
                similarity.index(&item.id, text);
            }
        }
        similarity
    }

    pub fn index(&mut self, id: &str, text: &str) {
        self.terms.insert(id.to_string(), tokenize(text));
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl SimilarityLookup for KeywordSimilarity {
    async fn score(&self, content_id: &str, query: &str) -> Result<Option<f32>> {
        let Some(item_terms) = self.terms.get(content_id) else {
            return Ok(None);
        };
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Ok(None);
        }
        let overlap = query_terms.intersection(item_terms).count();
        Ok(Some(overlap as f32 / query_terms.len() as f32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_loader() {
        let loader = InMemoryContentLoader::new().with_text(
            "doc-1",
            ContentType::Text,
            "Doc",
            "Some text",
        );

        let loaded = loader.load("doc-1").await.unwrap();
        assert_eq!(loaded.text, "Some text");
        assert!(matches!(
            loader.load("missing").await,
            Err(ContextError::Loader { .. })
        ));
    }

    #[tokio::test]
    async fn test_keyword_similarity() {
        let items = vec![
            CandidateItem::new("a", ContentType::Text, "A")
                .with_content("This is a Rust async function example"),
            CandidateItem::new("b", ContentType::Text, "B").with_content("Cooking pasta"),
        ];
        let similarity = KeywordSimilarity::from_items(&items);

        let a = similarity.score("a", "async function syntax").await.unwrap();
        let b = similarity.score("b", "async function syntax").await.unwrap();
        assert!((a.unwrap() - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(b, Some(0.0));
        assert_eq!(similarity.score("c", "async").await.unwrap(), None);
    }
}
