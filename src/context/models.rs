//! Data models for context optimization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Kind of content carried by a candidate item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Code,
    Image,
    List,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Code => "code",
            ContentType::Image => "image",
            ContentType::List => "list",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional overrides to the relevance formula
///
/// Factors can be supplied per call and per item; item-level values win.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringFactors {
    /// Recency (0.0-1.0)
    #[serde(default)]
    pub recency: Option<f32>,
    /// User interaction signal (0.0-1.0)
    #[serde(default)]
    pub user_interaction: Option<f32>,
    /// Per content type weight overrides
    #[serde(default)]
    pub content_type_weights: Option<HashMap<ContentType, f32>>,
    /// Manually assigned relevance (0.0-1.0)
    #[serde(default)]
    pub manual_relevance: Option<f32>,
    /// Explicit user selection
    #[serde(default)]
    pub selected_by_user: Option<bool>,
}

impl ScoringFactors {
    /// Layer these factors over `base`, keeping any value set here
    pub fn layered_over(&self, base: &ScoringFactors) -> ScoringFactors {
        ScoringFactors {
            recency: self.recency.or(base.recency),
            user_interaction: self.user_interaction.or(base.user_interaction),
            content_type_weights: self
                .content_type_weights
                .clone()
                .or_else(|| base.content_type_weights.clone()),
            manual_relevance: self.manual_relevance.or(base.manual_relevance),
            selected_by_user: self.selected_by_user.or(base.selected_by_user),
        }
    }

    pub fn is_selected_by_user(&self) -> bool {
        self.selected_by_user.unwrap_or(false)
    }
}

/// Candidate content handed to the optimizer by external storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateItem {
    pub id: String,
    pub content_type: ContentType,
    /// Full text; resolved through a `ContentLoader` when absent
    #[serde(default)]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub title: String,
    /// Precomputed token count
    #[serde(default)]
    pub tokens: Option<usize>,
    /// Precomputed similarity against the query (0.0-1.0)
    #[serde(default)]
    pub relevance: Option<f32>,
    #[serde(default)]
    pub factors: ScoringFactors,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CandidateItem {
    pub fn new(id: impl Into<String>, content_type: ContentType, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content_type,
            raw_content: None,
            title: title.into(),
            tokens: None,
            relevance: None,
            factors: ScoringFactors::default(),
            updated_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.raw_content = Some(content.into());
        self
    }

    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_relevance(mut self, relevance: f32) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_factors(mut self, factors: ScoringFactors) -> Self {
        self.factors = factors;
        self
    }

    pub fn selected_by_user(mut self) -> Self {
        self.factors.selected_by_user = Some(true);
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Contiguous, token-bounded slice of one item's text
///
/// `start_index`/`end_index` are byte offsets into the text passed to the chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub content: String,
    pub tokens: usize,
    pub start_index: usize,
    pub end_index: usize,
}

impl ContentChunk {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }
}

/// Selected (possibly chunked or compressed) content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedContentItem {
    pub id: String,
    pub content: String,
    pub title: String,
    pub content_type: ContentType,
    pub tokens: usize,
    pub relevance: f32,
    /// Present only when the source item was split
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
    pub metadata: HashMap<String, String>,
}

impl OptimizedContentItem {
    pub fn is_compressed(&self) -> bool {
        self.metadata.get("compressed").map(String::as_str) == Some("true")
    }
}

/// Final token-accounted selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedContext {
    pub items: Vec<OptimizedContentItem>,
    pub total_tokens: usize,
    pub remaining_tokens: usize,
    pub original_content_count: usize,
    pub selected_content_count: usize,
    pub query: String,
}

impl OptimizedContext {
    /// Context with no selected items
    pub fn empty(query: &str, original_content_count: usize, available_tokens: usize) -> Self {
        Self {
            items: Vec::new(),
            total_tokens: 0,
            remaining_tokens: available_tokens,
            original_content_count,
            selected_content_count: 0,
            query: query.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Render the selection as prompt sections in selection order
    pub fn render(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            match item.chunk_index {
                Some(idx) => out.push_str(&format!("## {} [part {}]\n", item.title, idx + 1)),
                None => out.push_str(&format!("## {}\n", item.title)),
            }
            if item.content_type == ContentType::Code {
                out.push_str("```\n");
                out.push_str(item.content.trim_end());
                out.push_str("\n```");
            } else {
                out.push_str(item.content.trim_end());
            }
        }
        out
    }
}
