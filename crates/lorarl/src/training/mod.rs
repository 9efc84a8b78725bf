//! Policy-gradient training of the adapter.
//!
//! Provides:
//! - `RlTrainingCallback` - session lifecycle hooks applying REINFORCE updates
//! - `AdamOptimizer` - Adam/AdamW with explicit, checkpointable moment buffers
//! - Reward table and loss

mod callback;
mod config;
mod optimizer;
mod reward;

pub use callback::{RestoreReport, RlTrainingCallback, SessionCallback, SkipReason, UpdateOutcome};
pub use config::{LogprobAccumulation, RlTrainingConfig};
pub use optimizer::{AdamOptimizer, OptimizerFamily, PolicyOptimizer};
pub use reward::{compute_reward, reinforce_loss, session_reward};
