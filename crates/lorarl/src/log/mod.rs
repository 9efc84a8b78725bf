//! Training metric logging.
//!
//! Provides:
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` emitting metrics as `tracing` events
//! - `RecordingLogger` keeping scalars in memory
//! - `TensorBoardLogger` for visualization (optional)
//! - `CompositeLogger` for multi-backend logging

mod console;
mod logger;
#[cfg(feature = "tensorboard")]
mod tensorboard;

pub use console::ConsoleLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger, RecordingLogger};
#[cfg(feature = "tensorboard")]
pub use tensorboard::TensorBoardLogger;

/// Reward of the session that completed an optimizer step.
pub const METRIC_REWARD: &str = "rl/reward";
/// Loss of that session, before division by the accumulation steps.
pub const METRIC_LOSS: &str = "rl/loss";
/// Training step after the update.
pub const METRIC_TRAINING_STEP: &str = "rl/training_step";
/// Global gradient norm before clipping, when clipping is enabled.
pub const METRIC_GRAD_NORM: &str = "rl/grad_norm";
