//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_transfers_prepared_total` - Prepares accepted (RESERVED)
//! - `ledger_transfers_committed_total` - Fulfilments committed
//! - `ledger_transfers_aborted_total` - Transfers aborted (any cause)
//! - `ledger_transfers_expired_total` - Transfers expired
//! - `ledger_transfers_settled_total` - Transfers settled
//! - `ledger_duplicate_replays_total` - Identical resubmissions replayed
//! - `ledger_limit_rejections_total` - Net debit cap rejections
//! - `ledger_operation_duration_seconds` - Histogram of engine operation latencies
//! - `ledger_sweep_duration_seconds` - Histogram of sweep cycle durations
//! - `ledger_sweep_lost_races_total` - Sweeper candidates already terminal
//! - `ledger_windows_total{action}` - Settlement window transitions (closed, settled, aborted)

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Prepares accepted
    pub transfers_prepared: IntCounter,

    /// Fulfilments committed
    pub transfers_committed: IntCounter,

    /// Transfers aborted
    pub transfers_aborted: IntCounter,

    /// Transfers expired
    pub transfers_expired: IntCounter,

    /// Transfers settled
    pub transfers_settled: IntCounter,

    /// Identical resubmissions replayed
    pub duplicate_replays: IntCounter,

    /// Net debit cap rejections
    pub limit_rejections: IntCounter,

    /// Engine operation latency by operation
    pub operation_duration: HistogramVec,

    /// Sweep cycle duration
    pub sweep_duration: Histogram,

    /// Sweeper lost races
    pub sweep_lost_races: IntCounter,

    /// Windows by terminal action (closed, settled, aborted)
    pub windows: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let transfers_prepared = counter(
            &registry,
            "ledger_transfers_prepared_total",
            "Prepares accepted into RESERVED",
        )?;
        let transfers_committed = counter(
            &registry,
            "ledger_transfers_committed_total",
            "Fulfilments committed",
        )?;
        let transfers_aborted = counter(
            &registry,
            "ledger_transfers_aborted_total",
            "Transfers aborted",
        )?;
        let transfers_expired = counter(
            &registry,
            "ledger_transfers_expired_total",
            "Transfers expired",
        )?;
        let transfers_settled = counter(
            &registry,
            "ledger_transfers_settled_total",
            "Transfers settled",
        )?;
        let duplicate_replays = counter(
            &registry,
            "ledger_duplicate_replays_total",
            "Identical resubmissions replayed",
        )?;
        let limit_rejections = counter(
            &registry,
            "ledger_limit_rejections_total",
            "Net debit cap rejections",
        )?;
        let sweep_lost_races = counter(
            &registry,
            "ledger_sweep_lost_races_total",
            "Sweeper candidates that were already terminal",
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ledger_operation_duration_seconds",
                "Histogram of engine operation latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 1.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let sweep_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_sweep_duration_seconds",
                "Histogram of sweep cycle durations",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(sweep_duration.clone()))?;

        let windows = IntCounterVec::new(
            Opts::new("ledger_windows_total", "Settlement window transitions"),
            &["action"],
        )?;
        registry.register(Box::new(windows.clone()))?;

        Ok(Self {
            transfers_prepared,
            transfers_committed,
            transfers_aborted,
            transfers_expired,
            transfers_settled,
            duplicate_replays,
            limit_rejections,
            operation_duration,
            sweep_duration,
            sweep_lost_races,
            windows,
            registry,
        })
    }

    /// Record operation latency
    pub fn record_operation(&self, operation: &str, duration_seconds: f64) {
        self.operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Record a window transition
    pub fn record_window(&self, action: &str) {
        self.windows.with_label_values(&[action]).inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> String {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.transfers_prepared.get(), 0);
        assert_eq!(metrics.transfers_settled.get(), 0);
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.transfers_committed.inc();
        assert_eq!(a.transfers_committed.get(), 1);
        assert_eq!(b.transfers_committed.get(), 0);
    }

    #[test]
    fn test_window_counter_labels() {
        let metrics = Metrics::new().unwrap();
        metrics.record_window("closed");
        metrics.record_window("closed");
        metrics.record_window("settled");

        assert_eq!(metrics.windows.with_label_values(&["closed"]).get(), 2);
        assert_eq!(metrics.windows.with_label_values(&["settled"]).get(), 1);
    }

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.transfers_prepared.inc();
        metrics.record_operation("prepare", 0.002);

        let text = metrics.render();
        assert!(text.contains("ledger_transfers_prepared_total 1"));
        assert!(text.contains("ledger_operation_duration_seconds"));
    }
}
