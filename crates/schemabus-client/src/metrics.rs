//! Metrics sink used by producers and consumers.
//!
//! The client only needs two call shapes, counter increments and duration
//! observations. Exposition is left to the sink; [`InMemoryMetrics`] can
//! render the Prometheus text format for tests and the CLI.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};

/// Records successfully published.
pub const MESSAGES_PRODUCED: &str = "schemabus_messages_produced_total";
/// Records handed to a handler.
pub const MESSAGES_CONSUMED: &str = "schemabus_messages_consumed_total";
/// Errors by kind.
pub const ERRORS: &str = "schemabus_errors_total";
/// Records delivered as raw bytes after a decode failure.
pub const DECODE_FALLBACKS: &str = "schemabus_decode_fallback_total";
/// Time spent in a handler.
pub const PROCESSING_SECONDS: &str = "schemabus_message_processing_seconds";
/// Time spent in one synchronous publish.
pub const PRODUCE_SECONDS: &str = "schemabus_produce_duration_seconds";

/// Metric labels as `(name, value)` pairs.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Destination for client metrics.
pub trait MetricsSink: Send + Sync {
    /// Increment the counter `name` by one.
    fn increment(&self, name: &str, labels: Labels<'_>);

    /// Record one observation of `seconds` for histogram `name`.
    fn observe(&self, name: &str, labels: Labels<'_>, seconds: f64);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _labels: Labels<'_>) {}

    fn observe(&self, _name: &str, _labels: Labels<'_>, _seconds: f64) {}
}

type SeriesKey = (String, Vec<(String, String)>);

fn series_key(name: &str, labels: Labels<'_>) -> SeriesKey {
    let mut labels: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    labels.sort();
    (name.to_string(), labels)
}

#[derive(Debug, Default, Clone, Copy)]
struct Summary {
    count: u64,
    sum: f64,
}

/// Sink that keeps counters and observation summaries in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<SeriesKey, u64>>,
    summaries: Mutex<BTreeMap<SeriesKey, Summary>>,
}

impl InMemoryMetrics {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter series (0 if never incremented).
    #[must_use]
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(&series_key(name, labels)).copied().unwrap_or(0)
    }

    /// Sum of a counter over all label sets.
    #[must_use]
    pub fn counter_total(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .iter()
            .filter(|((series, _), _)| series == name)
            .map(|(_, value)| *value)
            .sum()
    }

    /// Number of observations recorded for a histogram series.
    #[must_use]
    pub fn observations(&self, name: &str, labels: Labels<'_>) -> u64 {
        let summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        summaries
            .get(&series_key(name, labels))
            .map_or(0, |summary| summary.count)
    }

    /// Render all series in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last_name = None;
        for ((name, labels), value) in counters.iter() {
            if last_name != Some(name) {
                let _ = writeln!(out, "# TYPE {name} counter");
                last_name = Some(name);
            }
            let _ = writeln!(out, "{name}{} {value}", render_labels(labels));
        }
        drop(counters);

        let summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last_name = None;
        for ((name, labels), summary) in summaries.iter() {
            if last_name != Some(name) {
                let _ = writeln!(out, "# TYPE {name} summary");
                last_name = Some(name);
            }
            let labels = render_labels(labels);
            let _ = writeln!(out, "{name}_sum{labels} {}", summary.sum);
            let _ = writeln!(out, "{name}_count{labels} {}", summary.count);
        }

        out
    }
}

fn render_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", inner.join(","))
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, labels: Labels<'_>) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        *counters.entry(series_key(name, labels)).or_insert(0) += 1;
    }

    fn observe(&self, name: &str, labels: Labels<'_>, seconds: f64) {
        let mut summaries = self.summaries.lock().unwrap_or_else(PoisonError::into_inner);
        let summary = summaries.entry(series_key(name, labels)).or_default();
        summary.count += 1;
        summary.sum += seconds;
    }
}
