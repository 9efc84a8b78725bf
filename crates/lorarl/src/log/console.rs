//! Console logging backend.

use super::MetricLogger;
use std::collections::BTreeMap;

/// Logger that emits metrics as `tracing` events.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!(step, metric = name, value, "metric");
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        // one line per step
        tracing::info!(step, "{}", format_metrics(metrics));
    }
}

fn format_metrics(metrics: &BTreeMap<String, f64>) -> String {
    metrics
        .iter()
        .map(|(key, value)| format!("{}={:.4}", key, value))
        .collect::<Vec<_>>()
        .join(", ")
}
