//! Metric sink contract.
//!
//! The engine records counters, histograms and gauges through this trait;
//! wiring an actual exporter is the host's concern.

/// Label pairs attached to a metric sample.
pub type MetricLabels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricSink: Send + Sync {
    fn incr_counter(&self, name: &str, labels: MetricLabels<'_>);
    fn observe_histogram(&self, name: &str, value: f64, labels: MetricLabels<'_>);
    fn set_gauge(&self, name: &str, value: f64, labels: MetricLabels<'_>);
}

/// Sink that discards every sample.
#[derive(Debug, Default)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn incr_counter(&self, _name: &str, _labels: MetricLabels<'_>) {}
    fn observe_histogram(&self, _name: &str, _value: f64, _labels: MetricLabels<'_>) {}
    fn set_gauge(&self, _name: &str, _value: f64, _labels: MetricLabels<'_>) {}
}

/// Metric names emitted by the engine.
pub mod names {
    pub const CYCLE_TOTAL: &str = "sync_cycles_total";
    pub const CYCLE_DURATION_MS: &str = "sync_cycle_duration_ms";
    pub const CONFLICTS_TOTAL: &str = "sync_conflicts_total";
    pub const DEAD_LETTER_DEPTH: &str = "sync_dead_letter_depth";
}
