//! Example: optimize a JSON file of candidate items
//!
//! Usage:
//!   cargo run --example optimize_file -- candidates.json "query text" 4000
//!
//! The file holds an array of candidate items, e.g.
//! `[{"id": "a", "content_type": "text", "title": "A", "raw_content": "..."}]`.
//! Configuration is read from `context_optimizer.toml` (optional) and
//! `CONTEXT_OPTIMIZER__*` environment variables.

use anyhow::Context;
use context_optimizer::{
    config::init_tracing,
    context::KeywordSimilarity,
    prelude::*,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load(Some("context_optimizer"))?;
    init_tracing(&config.logging)?;

    let mut args = std::env::args().skip(1);
    let path = args.next().context("missing candidates file argument")?;
    let query = args.next().unwrap_or_default();
    let budget: usize = match args.next() {
        Some(value) => value.parse().context("budget must be a non-negative integer")?,
        None => 4000,
    };

    let raw = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
    let candidates: Vec<CandidateItem> =
        serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path))?;

    let similarity = Arc::new(KeywordSimilarity::from_items(&candidates));
    let optimizer = ContextOptimizer::from_config(&config)?.with_similarity(similarity);
    let context = optimizer
        .optimize(&candidates, &query, budget, &config.optimizer)
        .await?;

    let plan = TokenBudget::new(budget, config.optimizer.reserve_tokens);
    let allocation = plan.allocation(context.total_tokens);
    eprintln!(
        "selected {} of {} items: {} tokens used, {} of {} remaining",
        context.selected_content_count,
        context.original_content_count,
        allocation.used,
        allocation.remaining,
        allocation.available
    );
    println!("{}", context.render());

    Ok(())
}
