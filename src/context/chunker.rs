//! Content-aware chunking of oversized items
//!
//! Every strategy partitions the input into contiguous byte ranges: chunk
//! contents concatenated in order reproduce the input exactly. Separators
//! (blank lines, sentence-ending whitespace) stay attached to the unit they
//! follow. Fixed-size chunking is the terminal strategy; every other strategy
//! hands oversized units down to it.

use super::models::{ContentChunk, ContentType};
use super::token_estimator::TokenEstimator;
use crate::error::{ContextError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n\s*").unwrap());

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]+\s+").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static CODE_DECLARATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^((export|default|pub(\([^)]*\))?|public|private|protected|internal|static|async|unsafe|abstract|final|extern)\s+)*(fn|def|function|class|struct|enum|trait|impl|interface|module|mod|func|namespace)\b",
    )
    .unwrap()
});

static CODE_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(import\s|from\s+\S+\s+import\s|use\s|#include\b|require\(|package\s)").unwrap()
});

static CODE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^(//|/\*|#(\s|$)|"""|'''|@\w)"#).unwrap());

static LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([-*+•]|\d+[.)]|[A-Za-z][.)])\s+\S").unwrap());

/// Chunking strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Blank-line separated paragraphs
    Paragraph,
    /// Sentences
    Semantic,
    /// Structural boundaries in source code
    CodeAware,
    /// Runs of list items kept apart from prose
    ListAware,
    /// Whitespace-delimited words
    FixedSize,
}

impl ChunkStrategy {
    /// Strategy used for a content type
    pub fn for_content_type(content_type: ContentType, list_aware: bool) -> Self {
        match content_type {
            ContentType::Code => ChunkStrategy::CodeAware,
            ContentType::List => ChunkStrategy::ListAware,
            ContentType::Text if list_aware => ChunkStrategy::ListAware,
            _ => ChunkStrategy::Paragraph,
        }
    }
}

/// Splits text into token-bounded chunks
pub struct Chunker {
    estimator: Arc<dyn TokenEstimator>,
}

impl Chunker {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { estimator }
    }

    /// Chunk with the default strategy for `content_type`
    pub fn chunk(
        &self,
        text: &str,
        content_type: ContentType,
        max_chunk_tokens: usize,
    ) -> Result<Vec<ContentChunk>> {
        self.chunk_with(
            ChunkStrategy::for_content_type(content_type, false),
            text,
            max_chunk_tokens,
        )
    }

    /// Chunk with an explicit strategy, falling back to fixed-size chunking
    /// when the strategy fails or yields no usable partition
    pub fn chunk_with(
        &self,
        strategy: ChunkStrategy,
        text: &str,
        max_chunk_tokens: usize,
    ) -> Result<Vec<ContentChunk>> {
        if max_chunk_tokens == 0 {
            return Err(ContextError::InvalidInput(
                "max_chunk_tokens must be at least 1".to_string(),
            ));
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }

        match self.run(strategy, text, 0, text.len(), max_chunk_tokens) {
            Ok(chunks) if is_partition(&chunks, text.len()) => {
                debug!("{:?} chunking produced {} chunks", strategy, chunks.len());
                return Ok(chunks);
            }
            Ok(_) => warn!("{:?} chunking produced no usable chunks", strategy),
            Err(e) => warn!("{:?} chunking failed: {}", strategy, e),
        }

        if strategy == ChunkStrategy::FixedSize {
            return Err(ContextError::Chunking(
                "fixed-size chunking failed".to_string(),
            ));
        }

        let chunks = self.run(ChunkStrategy::FixedSize, text, 0, text.len(), max_chunk_tokens)?;
        if !is_partition(&chunks, text.len()) {
            return Err(ContextError::Chunking(
                "fixed-size chunking produced no usable chunks".to_string(),
            ));
        }
        Ok(chunks)
    }

    fn run(
        &self,
        strategy: ChunkStrategy,
        text: &str,
        start: usize,
        end: usize,
        max: usize,
    ) -> Result<Vec<ContentChunk>> {
        match strategy {
            ChunkStrategy::Paragraph => {
                let breaks = match_ends(&PARAGRAPH_BREAK, text, start, end);
                let units = units_between(start, end, breaks);
                self.accumulate(text, &units, max, Some(ChunkStrategy::FixedSize))
            }
            ChunkStrategy::Semantic => {
                let units = units_between(start, end, match_ends(&SENTENCE_END, text, start, end));
                self.accumulate(text, &units, max, Some(ChunkStrategy::FixedSize))
            }
            ChunkStrategy::FixedSize => {
                let boundaries = WHITESPACE
                    .find_iter(&text[start..end])
                    .filter(|m| m.start() > 0)
                    .map(|m| start + m.end())
                    .collect();
                let units = units_between(start, end, boundaries);
                self.accumulate(text, &units, max, None)
            }
            ChunkStrategy::CodeAware => {
                let boundaries = code_boundaries(text, start, end);
                if boundaries.is_empty() {
                    debug!("No structural boundaries found, using paragraph chunking");
                    return self.run(ChunkStrategy::Paragraph, text, start, end, max);
                }
                let units = units_between(start, end, boundaries);
                self.accumulate(text, &units, max, Some(ChunkStrategy::FixedSize))
            }
            ChunkStrategy::ListAware => {
                let mut chunks = Vec::new();
                for (seg_start, seg_end, is_list) in list_segments(text, start, end) {
                    if is_list {
                        let items = line_starts_matching(&LIST_ITEM, text, seg_start, seg_end);
                        let units = units_between(seg_start, seg_end, items);
                        chunks.extend(self.accumulate(
                            text,
                            &units,
                            max,
                            Some(ChunkStrategy::FixedSize),
                        )?);
                    } else {
                        chunks.extend(self.run(
                            ChunkStrategy::Paragraph,
                            text,
                            seg_start,
                            seg_end,
                            max,
                        )?);
                    }
                }
                Ok(chunks)
            }
        }
    }

    /// Greedily merge consecutive units while the running sum of their
    /// token counts stays within `max`. Each unit is counted once, in order;
    /// the joined span is counted once more when the chunk is emitted.
    fn accumulate(
        &self,
        text: &str,
        units: &[(usize, usize)],
        max: usize,
        overflow: Option<ChunkStrategy>,
    ) -> Result<Vec<ContentChunk>> {
        let mut chunks = Vec::new();
        let mut pending: Vec<(usize, usize)> = Vec::new();
        let mut pending_tokens = 0;

        for &(unit_start, unit_end) in units {
            let tokens = self.count(&text[unit_start..unit_end])?;

            if tokens <= max {
                if pending_tokens + tokens > max {
                    self.flush(text, &mut pending, max, &mut chunks)?;
                    pending_tokens = 0;
                }
                pending.push((unit_start, unit_end));
                pending_tokens += tokens;
                continue;
            }

            self.flush(text, &mut pending, max, &mut chunks)?;
            pending_tokens = 0;
            match overflow {
                Some(strategy) => {
                    debug!(
                        "Unit of {} tokens exceeds {}, splitting with {:?}",
                        tokens, max, strategy
                    );
                    chunks.extend(self.run(strategy, text, unit_start, unit_end, max)?);
                }
                // Indivisible unit: emitted on its own rather than dropped
                None => chunks.push(chunk_at(text, unit_start, unit_end, tokens)),
            }
        }

        self.flush(text, &mut pending, max, &mut chunks)?;
        Ok(chunks)
    }

    /// Emit the pending units as one chunk with an exact count of the joined
    /// span. Tokenizers are not additive across unit boundaries, so a span
    /// counted above `max` gives up trailing units to the next chunk.
    fn flush(
        &self,
        text: &str,
        pending: &mut Vec<(usize, usize)>,
        max: usize,
        chunks: &mut Vec<ContentChunk>,
    ) -> Result<()> {
        let mut rest = &pending[..];
        while let Some(&(start, _)) = rest.first() {
            let mut take = rest.len();
            let mut tokens = self.count(&text[start..rest[take - 1].1])?;
            while tokens > max && take > 1 {
                take -= 1;
                tokens = self.count(&text[start..rest[take - 1].1])?;
            }
            chunks.push(chunk_at(text, start, rest[take - 1].1, tokens));
            rest = &rest[take..];
        }
        pending.clear();
        Ok(())
    }

    fn count(&self, text: &str) -> Result<usize> {
        self.estimator.try_estimate(text)
    }
}

fn chunk_at(text: &str, start: usize, end: usize, tokens: usize) -> ContentChunk {
    ContentChunk {
        content: text[start..end].to_string(),
        tokens,
        start_index: start,
        end_index: end,
    }
}

/// Whether `chunks` tile `[0, len)` in order without gaps or overlap
pub fn is_partition(chunks: &[ContentChunk], len: usize) -> bool {
    if chunks.is_empty() {
        return len == 0;
    }
    let mut expected = 0;
    for chunk in chunks {
        if chunk.start_index != expected
            || chunk.end_index <= chunk.start_index
            || chunk.content.len() != chunk.len()
        {
            return false;
        }
        expected = chunk.end_index;
    }
    expected == len
}

/// Split `[start, end)` into consecutive units at the given boundaries
fn units_between(start: usize, end: usize, mut boundaries: Vec<usize>) -> Vec<(usize, usize)> {
    boundaries.retain(|&b| b > start && b < end);
    boundaries.sort_unstable();
    boundaries.dedup();

    let mut units = Vec::with_capacity(boundaries.len() + 1);
    let mut unit_start = start;
    for boundary in boundaries {
        units.push((unit_start, boundary));
        unit_start = boundary;
    }
    units.push((unit_start, end));
    units
}

fn match_ends(re: &Regex, text: &str, start: usize, end: usize) -> Vec<usize> {
    re.find_iter(&text[start..end])
        .map(|m| start + m.end())
        .collect()
}

fn line_spans(text: &str, start: usize, end: usize) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = start;
    text[start..end].split_inclusive('\n').map(move |line| {
        let line_start = offset;
        offset += line.len();
        (line_start, line)
    })
}

fn line_starts_matching(re: &Regex, text: &str, start: usize, end: usize) -> Vec<usize> {
    line_spans(text, start, end)
        .filter(|(_, line)| re.is_match(line))
        .map(|(line_start, _)| line_start)
        .collect()
}

/// Split points before declarations, imports and comments, and after
/// closing-brace lines
fn code_boundaries(text: &str, start: usize, end: usize) -> Vec<usize> {
    let mut boundaries = Vec::new();
    for (line_start, line) in line_spans(text, start, end) {
        let trimmed = line.trim_start();
        if CODE_DECLARATION.is_match(trimmed)
            || CODE_IMPORT.is_match(trimmed)
            || CODE_COMMENT.is_match(trimmed)
            || trimmed.trim_end() == "{"
        {
            boundaries.push(line_start);
        }
        if matches!(trimmed.trim_end(), "}" | "};" | "})" | "});") {
            boundaries.push(line_start + line.len());
        }
    }
    boundaries.retain(|&b| b > start && b < end);
    boundaries
}

/// Partition into alternating prose and list segments. Blank lines stay with
/// the segment they follow; indented lines continue a list item.
fn list_segments(text: &str, start: usize, end: usize) -> Vec<(usize, usize, bool)> {
    let mut segments = Vec::new();
    let mut seg_start = start;
    let mut seg_is_list: Option<bool> = None;

    for (line_start, line) in line_spans(text, start, end) {
        if line.trim().is_empty() {
            continue;
        }
        let continues_list =
            seg_is_list == Some(true) && line.starts_with(|c: char| c == ' ' || c == '\t');
        let is_list = LIST_ITEM.is_match(line) || continues_list;

        match seg_is_list {
            None => seg_is_list = Some(is_list),
            Some(current) if current != is_list => {
                segments.push((seg_start, line_start, current));
                seg_start = line_start;
                seg_is_list = Some(is_list);
            }
            Some(_) => {}
        }
    }

    segments.push((seg_start, end, seg_is_list.unwrap_or(false)));
    segments
}
