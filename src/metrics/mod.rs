//! Metrics collection for optimization runs

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Histogram, Opts, Registry,
};

/// Process-wide metrics; `None` if registration failed
pub static METRICS: Lazy<Option<Metrics>> = Lazy::new(|| match Metrics::new() {
    Ok(metrics) => Some(metrics),
    Err(e) => {
        tracing::warn!("Failed to initialize metrics: {}", e);
        None
    }
});

/// Access the process-wide metrics
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.as_ref()
}

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    pub optimizations: CounterVec,
    pub items_skipped: CounterVec,
    pub items_chunked: Counter,
    pub compressions: Counter,
    pub scoring_fallbacks: Counter,
    pub tokens_used: Histogram,
    pub tokens_remaining: Histogram,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let optimizations = register_counter_vec_with_registry!(
            Opts::new("context_optimizations_total", "Total optimization runs"),
            &["outcome"],
            registry
        )?;

        let items_skipped = register_counter_vec_with_registry!(
            Opts::new(
                "context_items_skipped_total",
                "Candidates or chunks left out of a selection"
            ),
            &["reason"],
            registry
        )?;

        let items_chunked = register_counter_with_registry!(
            Opts::new("context_items_chunked_total", "Candidates split into chunks"),
            registry
        )?;

        let compressions = register_counter_with_registry!(
            Opts::new("context_compressions_total", "Emergency compression passes"),
            registry
        )?;

        let scoring_fallbacks = register_counter_with_registry!(
            Opts::new("context_scoring_fallbacks_total", "Scores replaced by the neutral default"),
            registry
        )?;

        let tokens_used = register_histogram_with_registry!(
            "context_tokens_used",
            "Tokens selected per optimization",
            registry
        )?;

        let tokens_remaining = register_histogram_with_registry!(
            "context_tokens_remaining",
            "Tokens left unused per optimization",
            registry
        )?;

        Ok(Self {
            registry,
            optimizations,
            items_skipped,
            items_chunked,
            compressions,
            scoring_fallbacks,
            tokens_used,
            tokens_remaining,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished optimization
    pub fn record_optimization(&self, outcome: &str, used: usize, remaining: usize) {
        self.optimizations.with_label_values(&[outcome]).inc();
        self.tokens_used.observe(used as f64);
        self.tokens_remaining.observe(remaining as f64);
    }

    pub fn record_skip(&self, reason: &str) {
        self.items_skipped.with_label_values(&[reason]).inc();
    }

    pub fn record_chunked(&self) {
        self.items_chunked.inc();
    }

    pub fn record_compression(&self) {
        self.compressions.inc();
    }

    pub fn record_scoring_fallback(&self) {
        self.scoring_fallbacks.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
