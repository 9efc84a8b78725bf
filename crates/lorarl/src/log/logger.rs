//! Metric logger trait and composites.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Trait for logging metrics to various backends.
pub trait MetricLogger: Send + Sync {
    /// Log a scalar value (e.g. reward, loss).
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log a group of metrics for one step.
    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        for (name, value) in metrics {
            self.log_scalar(name, *value, step);
        }
    }

    /// Close the logger and flush any pending writes.
    fn close(&self) {}
}

/// A logger that does nothing (default).
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &BTreeMap<String, f64>, _step: u64) {}
}

/// A composite logger that dispatches to multiple backends.
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

/// Keeps every logged scalar as `(name, value, step)`.
#[derive(Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<(String, f64, u64)>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, f64, u64)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Values logged under `name`, in order.
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records()
            .into_iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, _)| v)
            .collect()
    }
}

impl MetricLogger for RecordingLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut records) = self.records.lock() {
            records.push((name.to_string(), value, step));
        }
    }
}

impl<L: MetricLogger + ?Sized> MetricLogger for std::sync::Arc<L> {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        (**self).log_scalar(name, value, step);
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        (**self).log_metrics(metrics, step);
    }

    fn close(&self) {
        (**self).close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(RecordingLogger::new());
        let b = Arc::new(RecordingLogger::new());
        let mut composite = CompositeLogger::new(vec![Box::new(a.clone())]);
        composite.add(Box::new(b.clone()));

        let mut metrics = BTreeMap::new();
        metrics.insert("rl/loss".to_string(), 0.5);
        metrics.insert("rl/reward".to_string(), 1.0);
        composite.log_metrics(&metrics, 3);
        composite.log_scalar("rl/training_step", 3.0, 3);

        for logger in [&a, &b] {
            assert_eq!(logger.records().len(), 3);
            assert_eq!(logger.values("rl/reward"), vec![1.0]);
        }
    }

    #[test]
    fn test_noop_logger() {
        let logger = NoOpLogger;
        logger.log_scalar("rl/loss", 1.0, 0);
        logger.close();
    }
}
