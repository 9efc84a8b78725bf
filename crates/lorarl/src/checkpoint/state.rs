//! State directory layout and the training-step record.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Optimizer buffers inside a state directory.
pub const OPTIMIZER_STATE_FILE: &str = "optimizer_state.safetensors";
/// Training-step record inside a state directory.
pub const TRAINING_STEP_FILE: &str = "training_step.json";
/// Adapter checkpoint directory inside a state directory.
pub const LORA_WEIGHTS_DIR: &str = "lora_weights";

/// Paths of the files making up a saved training state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn optimizer_state(&self) -> PathBuf {
        self.root.join(OPTIMIZER_STATE_FILE)
    }

    pub fn training_step(&self) -> PathBuf {
        self.root.join(TRAINING_STEP_FILE)
    }

    pub fn lora_weights(&self) -> PathBuf {
        self.root.join(LORA_WEIGHTS_DIR)
    }

    /// Create the state directory if needed.
    pub fn ensure_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

/// Contents of `training_step.json`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrainingStepRecord {
    /// Completed optimizer steps
    pub training_step: u64,
}

impl TrainingStepRecord {
    pub fn new(training_step: u64) -> Self {
        Self { training_step }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
