//! Persisted training state.
//!
//! Provides:
//! - `StateLayout` - file layout of a state directory
//! - `TrainingStepRecord` - the `training_step.json` record

mod state;

pub use state::{StateLayout, TrainingStepRecord, LORA_WEIGHTS_DIR, OPTIMIZER_STATE_FILE, TRAINING_STEP_FILE};
