//! # lorarl
//!
//! REINFORCE training of low-rank adapters (LoRA) on a frozen causal language model.
//!
//! ## Overview
//!
//! lorarl provides:
//! - `LoraLanguageModel` - a frozen base transformer with a trainable low-rank adapter
//! - Logprob-capturing generation that keeps the autograd graph of the sampled sequence
//! - `RlTrainingCallback` - a session-driven REINFORCE update engine with gradient accumulation
//! - Checkpointing of adapter weights, optimizer buffers and the training step
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lorarl::prelude::*;
//!
//! let mut model = LoraLanguageModel::new(
//!     BaseModel::from_pretrained("models/base", Precision::Float32, DevicePlacement::Auto)?,
//!     RoleDict::default(),
//!     AdapterSource::Default,
//! )?;
//! let mut callback = RlTrainingCallback::new(RlTrainingConfig::default(), "state");
//!
//! callback.on_session_create(&session, &mut model)?;
//! let output = model.generate_with_logprob(&[history], &GenerationOptions::default(), "")?;
//! callback.record_logprob(output.logprobs[0].shallow_clone());
//! let outcome = callback.on_task_complete(&session, &mut model)?;
//! ```

pub mod agent;
pub mod checkpoint;
pub mod log;
pub mod model;
pub mod session;
pub mod testing;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::{AgentError, LogprobSink, LoraRlAgent};
    pub use crate::checkpoint::{StateLayout, TrainingStepRecord};
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger, NoOpLogger};
    pub use crate::model::{
        AdapterSource, BaseModel, BaseModelConfig, DevicePlacement, GenerationOptions,
        GenerationOutput, LanguageModel, LoraConfig, LoraLanguageModel, ModelMode, PolicyModel,
        Precision, RoleDict,
    };
    pub use crate::session::{
        ChatHistory, ChatHistoryItem, EvaluationRecord, Role, SampleStatus, Session,
        SessionEvaluationOutcome,
    };
    pub use crate::training::{
        LogprobAccumulation, OptimizerFamily, RestoreReport, RlTrainingCallback,
        RlTrainingConfig, SessionCallback, SkipReason, UpdateOutcome,
    };

    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum LoraRlError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Context limit: prompt length {prompt_len} reaches max_position_embeddings {max_positions}")]
    ContextLimit {
        prompt_len: usize,
        max_positions: usize,
    },

    #[error("Device memory exhausted: {0}")]
    MemoryExhaustion(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    TensorError(#[from] tch::TchError),
}

pub type Result<T> = core::result::Result<T, LoraRlError>;
