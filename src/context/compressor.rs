//! Emergency compression of already-selected content
//!
//! Low-relevance items are shrunk one at a time, most relevant first, until
//! the selection fits the target. Compression is lossy but never grows an
//! item, and re-compressing compressed text returns it unchanged.

use super::models::{ContentType, OptimizedContentItem};
use super::token_estimator::TokenEstimator;
use crate::config::CompressionConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

static PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t]*\n").unwrap());

static CHAR_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^'(\\[^'\n]{1,10}|[^\\'\n])'").unwrap());

static EXCESS_BLANK_LINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+\n").unwrap());

static SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^((export|default|pub(\([^)]*\))?|public|private|protected|internal|static|async|unsafe|abstract|final)\s+)*(fn|def|function|class|struct|enum|trait|impl|interface|func)\b",
    )
    .unwrap()
});

static IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(import\s|from\s+\S+\s+import\s|use\s|#include\b|require\(|package\s)").unwrap()
});

/// Marker replacing an elided body
const ELIDED: &str = "...";

/// Shrinks low-relevance selected items to reclaim budget
pub struct Compressor {
    estimator: Arc<dyn TokenEstimator>,
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(estimator: Arc<dyn TokenEstimator>, config: CompressionConfig) -> Self {
        Self { estimator, config }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Compress items until their total is at most `target_tokens` or no
    /// compressible item remains. The input order is preserved.
    pub fn compress(
        &self,
        mut items: Vec<OptimizedContentItem>,
        target_tokens: usize,
    ) -> Vec<OptimizedContentItem> {
        let mut total: usize = items.iter().map(|i| i.tokens).sum();
        if total <= target_tokens {
            return items;
        }

        let mut order: Vec<usize> = (0..items.len())
            .filter(|&i| items[i].relevance < self.config.keep_relevance)
            .collect();
        order.sort_by(|&a, &b| items[b].relevance.total_cmp(&items[a].relevance));

        let before = total;
        let mut compressed = 0;
        for idx in order {
            if total <= target_tokens {
                break;
            }
            let item = &mut items[idx];
            let Some(content) = self.compress_content(&item.content, item.content_type) else {
                continue;
            };
            let tokens = match self.estimator.try_estimate(&content) {
                Ok(tokens) => tokens,
                Err(e) => {
                    warn!("Token count failed while compressing {}: {}", item.id, e);
                    continue;
                }
            };
            if tokens >= item.tokens {
                continue;
            }

            debug!("Compressed {}: {} -> {} tokens", item.id, item.tokens, tokens);
            total -= item.tokens - tokens;
            let original = item.tokens.to_string();
            item.metadata
                .entry("original_tokens".to_string())
                .or_insert(original);
            item.metadata
                .insert("compressed".to_string(), "true".to_string());
            item.content = content;
            item.tokens = tokens;
            compressed += 1;
        }

        info!(
            "Compression pass: {} items compressed, {} -> {} tokens (target {})",
            compressed, before, total, target_tokens
        );
        items
    }

    /// Content-type specific compression; `None` when the type is not
    /// compressible or nothing would change
    pub fn compress_content(&self, content: &str, content_type: ContentType) -> Option<String> {
        let compressed = match content_type {
            ContentType::Text | ContentType::List => self.compress_text(content),
            ContentType::Code => self.compress_code(content),
            ContentType::Image => return None,
        };
        (compressed != content).then_some(compressed)
    }

    /// First paragraph plus any later paragraph carrying a key signal
    pub fn compress_text(&self, text: &str) -> String {
        let mut kept = Vec::new();
        for (idx, paragraph) in PARAGRAPH_BREAK
            .split(text)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .enumerate()
        {
            if idx == 0 || self.has_signal(paragraph) {
                kept.push(paragraph);
            }
        }
        kept.join("\n\n")
    }

    fn has_signal(&self, paragraph: &str) -> bool {
        let lower = paragraph.to_lowercase();
        self.config
            .signal_phrases
            .iter()
            .any(|phrase| contains_phrase(&lower, &phrase.to_lowercase()))
    }

    /// Strip comments and blank runs; elide bodies of long code
    pub fn compress_code(&self, code: &str) -> String {
        let stripped = strip_comments(code);
        let collapsed = EXCESS_BLANK_LINES.replace_all(&stripped, "\n\n");
        let collapsed = collapsed.trim_matches('\n');
        if collapsed.chars().count() <= self.config.code_elision_chars {
            return collapsed.to_string();
        }
        elide_bodies(collapsed)
    }
}

/// Whole-word (or whole-phrase) match
fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    haystack.match_indices(phrase).any(|(pos, _)| {
        let before = haystack[..pos].chars().next_back();
        let after = haystack[pos + phrase.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

fn strip_comments(code: &str) -> String {
    let without_blocks = strip_block_comments(code);
    let mut out = String::with_capacity(without_blocks.len());
    for line in without_blocks.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") || is_hash_comment(trimmed) {
            continue;
        }
        match trailing_comment_start(line) {
            Some(pos) => {
                out.push_str(line[..pos].trim_end());
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(line),
        }
    }
    out
}

/// Remove `/* ... */` comments, leaving string literals and `//` comments
/// untouched
fn strip_block_comments(code: &str) -> String {
    let mut out = String::with_capacity(code.len());
    let mut i = 0;
    while i < code.len() {
        let rest = &code[i..];
        if rest.starts_with("/*") {
            i += rest[2..].find("*/").map_or(rest.len(), |end| end + 4);
            continue;
        }
        let len = if rest.starts_with("//") {
            rest.find('\n').unwrap_or(rest.len())
        } else if let Some(len) = literal_len(rest) {
            len
        } else {
            rest.chars().next().map_or(1, char::len_utf8)
        };
        out.push_str(&rest[..len]);
        i += len;
    }
    out
}

/// Byte length of the string or char literal opening `rest`. Strings end at
/// the closing quote or the end of the line.
fn literal_len(rest: &str) -> Option<usize> {
    let quote = rest.chars().next()?;
    match quote {
        '"' | '`' => {
            let mut escaped = false;
            for (pos, c) in rest.char_indices().skip(1) {
                if c == '\n' {
                    return Some(pos);
                }
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == quote {
                    return Some(pos + 1);
                }
            }
            Some(rest.len())
        }
        '\'' => CHAR_LITERAL.find(rest).map(|m| m.end()),
        _ => None,
    }
}

fn is_hash_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#')
        && !(trimmed.starts_with("#include")
            || trimmed.starts_with("#define")
            || trimmed.starts_with("#[")
            || trimmed.starts_with("#!")
            || trimmed.starts_with("#if")
            || trimmed.starts_with("#endif")
            || trimmed.starts_with("#pragma"))
}

/// Position of a trailing `//` comment, skipped when the line has string
/// literals that could contain `//`
fn trailing_comment_start(line: &str) -> Option<usize> {
    if line.contains('"') || line.contains('\'') || line.contains('`') {
        return None;
    }
    line.find(" //")
}

/// Replace function/class bodies with their signature and an elision marker.
/// Brace-delimited bodies become `signature { ... }`; indentation-delimited
/// bodies (`def f():`) keep the signature and an indented marker line.
fn elide_bodies(code: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();

        if IMPORT.is_match(trimmed) || !SIGNATURE.is_match(trimmed) {
            out.push(line.to_string());
            i += 1;
            continue;
        }

        let indent = &line[..line.len() - trimmed.len()];

        if let Some(brace) = line.find('{') {
            let depth = brace_delta(line);
            if depth <= 0 {
                out.push(line.to_string());
                i += 1;
                continue;
            }
            out.push(format!("{}{{ {} }}", &line[..brace], ELIDED).trim_end().to_string());
            let mut depth = depth;
            i += 1;
            while i < lines.len() && depth > 0 {
                // a declaration at the outer indent means the braces never balanced
                let next = lines[i].trim_start();
                if indent_len(lines[i]) <= indent.len()
                    && (SIGNATURE.is_match(next) || IMPORT.is_match(next))
                {
                    break;
                }
                depth += brace_delta(lines[i]);
                i += 1;
            }
            continue;
        }

        if trimmed.trim_end().ends_with(':') {
            out.push(line.to_string());
            i += 1;
            let body_start = i;
            while i < lines.len()
                && (lines[i].trim().is_empty() || indent_len(lines[i]) > indent.len())
            {
                i += 1;
            }
            if i > body_start {
                out.push(format!("{}    {}", indent, ELIDED));
            }
            continue;
        }

        // signature continues on following lines; keep it verbatim
        out.push(line.to_string());
        i += 1;
    }

    out.join("\n")
}

/// Net brace depth change of a line, ignoring literals and `//` comments
fn brace_delta(line: &str) -> i64 {
    let mut depth = 0;
    let mut i = 0;
    while i < line.len() {
        let rest = &line[i..];
        if rest.starts_with("//") {
            break;
        }
        if let Some(len) = literal_len(rest) {
            i += len;
            continue;
        }
        let Some(c) = rest.chars().next() else {
            break;
        };
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        i += c.len_utf8();
    }
    depth
}

fn indent_len(line: &str) -> usize {
    line.len() - line.trim_start().len()
}
