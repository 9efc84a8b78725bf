//! Update engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// How logprobs of several turns in one session are combined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogprobAccumulation {
    /// Keep only the most recent turn
    #[default]
    LastTurn,
    /// Sum the logprobs of every turn
    Sum,
}

/// Configuration for the REINFORCE update engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlTrainingConfig {
    // Reward shaping
    /// Multiplier applied to every reward
    pub reward_weight: f64,
    /// Reward for a correct, completed session
    pub reward_correct: f64,
    /// Reward for an incorrect or failed session
    pub reward_incorrect: f64,
    /// Reward for a session that hit the task limit
    pub reward_timeout: f64,

    // Optimization
    /// Learning rate
    pub learning_rate: f64,
    /// Optimizer family name, `Adam` or `AdamW`
    pub optimizer_family: String,
    /// Sessions per optimizer step
    pub gradient_accumulation_steps: usize,
    /// Global gradient norm limit, off when unset
    pub max_grad_norm: Option<f64>,
    /// Overrides the family's default weight decay
    pub weight_decay: Option<f64>,

    /// Multi-turn logprob policy
    pub logprob_accumulation: LogprobAccumulation,
}

impl Default for RlTrainingConfig {
    fn default() -> Self {
        Self {
            reward_weight: 1.0,
            reward_correct: 1.0,
            reward_incorrect: -0.1,
            reward_timeout: -0.3,

            learning_rate: 1e-5,
            optimizer_family: "AdamW".to_string(),
            gradient_accumulation_steps: 1,
            max_grad_norm: None,
            weight_decay: None,

            logprob_accumulation: LogprobAccumulation::LastTurn,
        }
    }
}

impl RlTrainingConfig {
    /// Read a JSON configuration file; missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Set learning rate
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set optimizer family
    pub fn with_optimizer(mut self, family: impl Into<String>) -> Self {
        self.optimizer_family = family.into();
        self
    }

    /// Set gradient accumulation steps
    pub fn with_accumulation_steps(mut self, steps: usize) -> Self {
        self.gradient_accumulation_steps = steps;
        self
    }

    /// Set rewards for correct, incorrect and timed-out sessions
    pub fn with_rewards(mut self, correct: f64, incorrect: f64, timeout: f64) -> Self {
        self.reward_correct = correct;
        self.reward_incorrect = incorrect;
        self.reward_timeout = timeout;
        self
    }

    pub fn with_reward_weight(mut self, weight: f64) -> Self {
        self.reward_weight = weight;
        self
    }

    pub fn with_max_grad_norm(mut self, max_norm: f64) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    pub fn with_logprob_accumulation(mut self, mode: LogprobAccumulation) -> Self {
        self.logprob_accumulation = mode;
        self
    }

    /// Accumulation window length, never zero.
    pub fn accumulation_steps(&self) -> usize {
        self.gradient_accumulation_steps.max(1)
    }
}
