//! TensorBoard logging backend.

use super::MetricLogger;
use crate::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Writes training scalars to TensorBoard event files under a run directory.
pub struct TensorBoardLogger {
    writer: Mutex<SummaryWriter>,
    run: Option<String>,
}

impl TensorBoardLogger {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(log_dir.as_ref())?;
        Ok(Self {
            writer: Mutex::new(SummaryWriter::new(log_dir.as_ref())),
            run: None,
        })
    }

    /// Prefix every tag with `run/`, so several benchmark runs can share one log directory.
    pub fn with_run(mut self, run: impl Into<String>) -> Self {
        self.run = Some(run.into());
        self
    }

    fn tag(&self, name: &str) -> String {
        match &self.run {
            Some(run) => format!("{}/{}", run, name),
            None => name.to_string(),
        }
    }
}

impl MetricLogger for TensorBoardLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        let tag = self.tag(name);
        if let Ok(mut writer) = self.writer.lock() {
            writer.add_scalar(&tag, value as f32, step as usize);
        }
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: u64) {
        let tags: Vec<(String, f32)> = metrics
            .iter()
            .map(|(name, value)| (self.tag(name), *value as f32))
            .collect();
        if let Ok(mut writer) = self.writer.lock() {
            for (tag, value) in &tags {
                writer.add_scalar(tag, *value, step as usize);
            }
            let _ = writer.flush();
        }
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_prefixes_tags() {
        let dir = tempfile::tempdir().unwrap();
        let plain = TensorBoardLogger::new(dir.path().join("plain")).unwrap();
        assert_eq!(plain.tag("train/loss"), "train/loss");
        let run = TensorBoardLogger::new(dir.path().join("run"))
            .unwrap()
            .with_run("baseline");
        assert_eq!(run.tag("train/loss"), "baseline/train/loss");
    }

    #[test]
    fn test_metrics_land_in_event_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("tb");
        let logger = TensorBoardLogger::new(&log_dir).unwrap().with_run("run");

        logger.log_scalar("train/reward", 1.0, 0);
        logger.log_metrics(
            &BTreeMap::from([
                ("train/loss".to_string(), -0.5),
                ("train/grad_norm".to_string(), 0.25),
            ]),
            1,
        );
        logger.close();

        let events: Vec<_> = std::fs::read_dir(&log_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        assert!(!events.is_empty());
        assert!(events
            .iter()
            .any(|path| std::fs::metadata(path).unwrap().len() > 0));
    }
}
