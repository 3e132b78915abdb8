//! Tracing setup and the order metrics handle.

/// Initialize process-wide tracing/logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Plain-text logs, for running locally.
pub fn init_pretty() {
    tracing::init_pretty();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Counters for order lifecycle outcomes.
pub mod metrics;

pub use metrics::{MetricsSnapshot, OrderMetrics};
