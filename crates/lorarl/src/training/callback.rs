//! Session-driven REINFORCE update engine.

use super::config::{LogprobAccumulation, RlTrainingConfig};
use super::optimizer::{AdamOptimizer, OptimizerFamily, PolicyOptimizer};
use super::reward::{reinforce_loss, session_reward};
use crate::agent::LogprobSink;
use crate::checkpoint::{StateLayout, TrainingStepRecord};
use crate::log::{
    MetricLogger, NoOpLogger, METRIC_GRAD_NORM, METRIC_LOSS, METRIC_REWARD, METRIC_TRAINING_STEP,
};
use crate::model::{ModelMode, PolicyModel};
use crate::session::Session;
use crate::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tch::Tensor;

/// Why a completed session produced no gradient.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No logprob was recorded for the session
    MissingLogprob,
    /// The recorded logprob has no autograd graph
    DetachedLogprob,
    /// The model has no trainable parameters
    NoOptimizer,
}

/// Result of [`SessionCallback::on_task_complete`].
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome {
    Skipped(SkipReason),
    /// Gradients were accumulated; `accumulated` sessions are in the current window
    Accumulated {
        reward: f64,
        loss: f64,
        accumulated: usize,
    },
    /// The window was full and the optimizer stepped
    Stepped {
        reward: f64,
        loss: f64,
        training_step: u64,
    },
}

/// What [`SessionCallback::restore_state`] found.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RestoreReport {
    pub adapter_restored: bool,
    pub optimizer_restored: bool,
    pub training_step: u64,
    /// Non-fatal problems, also logged as warnings
    pub warnings: Vec<String>,
}

impl RestoreReport {
    fn warn(&mut self, message: String) {
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }
}

/// Lifecycle events of a training session.
pub trait SessionCallback<M: PolicyModel> {
    /// A session starts: prepare the optimizer and put the model in train mode.
    fn on_session_create(&mut self, session: &Session, model: &mut M) -> Result<()>;

    /// A session ended and has been scored: apply the REINFORCE update.
    fn on_task_complete(&mut self, session: &Session, model: &mut M) -> Result<UpdateOutcome>;

    /// Persist adapter, optimizer buffers and training step.
    fn on_state_save(&mut self, model: &M) -> Result<()>;

    /// Reload what [`SessionCallback::on_state_save`] wrote.
    fn restore_state(&mut self, model: &mut M) -> Result<RestoreReport>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingOutcome { sample_index: String },
}

/// REINFORCE update engine for one line of sessions.
pub struct RlTrainingCallback {
    config: RlTrainingConfig,
    layout: StateLayout,
    optimizer: Option<Box<dyn PolicyOptimizer>>,
    current_session_logprob: Option<Tensor>,
    gradient_accumulation_counter: usize,
    training_step: u64,
    logger: Box<dyn MetricLogger>,
    phase: Phase,
}

impl RlTrainingCallback {
    pub fn new(config: RlTrainingConfig, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            layout: StateLayout::new(state_dir),
            optimizer: None,
            current_session_logprob: None,
            gradient_accumulation_counter: 0,
            training_step: 0,
            logger: Box::new(NoOpLogger),
            phase: Phase::Idle,
        }
    }

    /// Set the metric logger.
    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &RlTrainingConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn training_step(&self) -> u64 {
        self.training_step
    }

    /// Sessions accumulated in the current window.
    pub fn accumulation_counter(&self) -> usize {
        self.gradient_accumulation_counter
    }

    pub fn optimizer(&self) -> Option<&dyn PolicyOptimizer> {
        self.optimizer.as_deref()
    }

    /// Logprob recorded for the running session and not yet consumed.
    pub fn pending_logprob(&self) -> Option<&Tensor> {
        self.current_session_logprob.as_ref()
    }

    /// Sample index of the session awaiting its outcome.
    pub fn active_session(&self) -> Option<&str> {
        match &self.phase {
            Phase::AwaitingOutcome { sample_index } => Some(sample_index),
            Phase::Idle => None,
        }
    }

    /// Build the optimizer on first need; `false` when the model has nothing to train.
    fn ensure_optimizer<M: PolicyModel>(&mut self, model: &M) -> Result<bool> {
        if self.optimizer.is_some() {
            return Ok(true);
        }

        let family: OptimizerFamily = self.config.optimizer_family.parse()?;
        let params = model.trainable_parameters();
        if params.is_empty() {
            tracing::warn!("Model has no trainable parameters, RL updates are disabled");
            return Ok(false);
        }

        let num_tensors = params.len();
        let optimizer = AdamOptimizer::new(
            params,
            family,
            self.config.learning_rate,
            self.config.weight_decay,
        )?;
        tracing::info!(
            family = ?family,
            learning_rate = self.config.learning_rate,
            num_tensors,
            "Initialized optimizer"
        );
        self.optimizer = Some(Box::new(optimizer));
        Ok(true)
    }

    fn apply_update(&mut self, reward: f64, logprob: Option<Tensor>) -> Result<UpdateOutcome> {
        let Some(optimizer) = self.optimizer.as_mut() else {
            tracing::warn!("No optimizer, skipping RL update");
            return Ok(UpdateOutcome::Skipped(SkipReason::NoOptimizer));
        };
        let Some(logprob) = logprob else {
            tracing::warn!("No logprob recorded for this session, skipping RL update");
            return Ok(UpdateOutcome::Skipped(SkipReason::MissingLogprob));
        };
        if !logprob.requires_grad() {
            tracing::warn!("Recorded logprob carries no gradient graph, skipping RL update");
            return Ok(UpdateOutcome::Skipped(SkipReason::DetachedLogprob));
        }

        let steps = self.config.accumulation_steps();
        let loss = reinforce_loss(&logprob, reward, &self.config)?;
        loss.f_backward()?;
        let loss_value = loss.f_double_value(&[])? * steps as f64;
        self.gradient_accumulation_counter += 1;

        if self.gradient_accumulation_counter < steps {
            tracing::debug!(
                reward,
                loss = loss_value,
                accumulated = self.gradient_accumulation_counter,
                steps,
                "Accumulated gradients"
            );
            return Ok(UpdateOutcome::Accumulated {
                reward,
                loss: loss_value,
                accumulated: self.gradient_accumulation_counter,
            });
        }

        let mut metrics = BTreeMap::new();
        if let Some(max_norm) = self.config.max_grad_norm {
            let norm = optimizer.clip_grad_norm(max_norm)?;
            metrics.insert(METRIC_GRAD_NORM.to_string(), norm);
        }
        optimizer.step()?;
        optimizer.zero_grad();
        self.gradient_accumulation_counter = 0;
        self.training_step += 1;

        tracing::info!(
            training_step = self.training_step,
            reward,
            loss = loss_value,
            "Updated LoRA parameters"
        );
        metrics.insert(METRIC_REWARD.to_string(), reward);
        metrics.insert(METRIC_LOSS.to_string(), loss_value);
        metrics.insert(METRIC_TRAINING_STEP.to_string(), self.training_step as f64);
        self.logger.log_metrics(&metrics, self.training_step);

        Ok(UpdateOutcome::Stepped {
            reward,
            loss: loss_value,
            training_step: self.training_step,
        })
    }
}

impl LogprobSink for RlTrainingCallback {
    fn record_logprob(&mut self, logprob: Tensor) {
        self.current_session_logprob = match self.current_session_logprob.take() {
            None => Some(logprob),
            Some(previous) => match self.config.logprob_accumulation {
                LogprobAccumulation::LastTurn => {
                    tracing::warn!(
                        session = self.active_session().unwrap_or("-"),
                        "Overwriting unconsumed logprob, only the last turn will be trained"
                    );
                    Some(logprob)
                }
                LogprobAccumulation::Sum => Some(previous + logprob),
            },
        };
    }
}

impl<M: PolicyModel> SessionCallback<M> for RlTrainingCallback {
    fn on_session_create(&mut self, session: &Session, model: &mut M) -> Result<()> {
        if let Phase::AwaitingOutcome { sample_index } = &self.phase {
            if self.current_session_logprob.is_some() {
                tracing::warn!(
                    stale = %sample_index,
                    session = %session.sample_index,
                    "Previous session never completed, discarding its logprob"
                );
            }
        }

        self.ensure_optimizer(model)?;
        model.set_mode(ModelMode::Train);
        self.current_session_logprob = None;
        self.phase = Phase::AwaitingOutcome {
            sample_index: session.sample_index.clone(),
        };
        tracing::debug!(session = %session.sample_index, "Session created");
        Ok(())
    }

    fn on_task_complete(&mut self, session: &Session, model: &mut M) -> Result<UpdateOutcome> {
        let reward = session_reward(session, &self.config);
        let logprob = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitingOutcome { .. } => self.current_session_logprob.take(),
            Phase::Idle => {
                tracing::warn!(session = %session.sample_index, "Task completed without session start");
                self.current_session_logprob = None;
                None
            }
        };

        let outcome = self.apply_update(reward, logprob);
        model.set_mode(ModelMode::Eval);
        outcome
    }

    fn on_state_save(&mut self, model: &M) -> Result<()> {
        self.layout.ensure_exists()?;
        model.save_adapter(&self.layout.lora_weights())?;

        match &self.optimizer {
            Some(optimizer) => {
                optimizer.save_state(&self.layout.optimizer_state())?;
                TrainingStepRecord::new(self.training_step).save(self.layout.training_step())?;
            }
            None => tracing::debug!("No optimizer, saving adapter only"),
        }

        tracing::info!(
            path = %self.layout.root().display(),
            training_step = self.training_step,
            "Training state saved"
        );
        Ok(())
    }

    fn restore_state(&mut self, model: &mut M) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();

        let lora_dir = self.layout.lora_weights();
        if lora_dir.exists() {
            match model.load_adapter(&lora_dir) {
                Ok(()) => report.adapter_restored = true,
                Err(e) => report.warn(format!("Failed to load adapter weights: {}", e)),
            }
        } else {
            report.warn(format!(
                "No adapter checkpoint at {}, keeping current weights",
                lora_dir.display()
            ));
        }

        self.ensure_optimizer(model)?;
        if let Some(optimizer) = self.optimizer.as_mut() {
            let path = self.layout.optimizer_state();
            if !path.exists() {
                report.warn(format!(
                    "No optimizer state at {}, using fresh optimizer state",
                    path.display()
                ));
            } else {
                match optimizer.load_state(&path) {
                    Ok(()) => report.optimizer_restored = true,
                    Err(e) => report.warn(format!(
                        "Failed to load optimizer state, using fresh optimizer state: {}",
                        e
                    )),
                }
            }
            optimizer.zero_grad();
        }

        self.training_step = match TrainingStepRecord::load(self.layout.training_step()) {
            Ok(record) => record.training_step,
            Err(e) => {
                report.warn(format!("Failed to load training step, starting at 0: {}", e));
                0
            }
        };
        self.gradient_accumulation_counter = 0;
        self.current_session_logprob = None;
        self.phase = Phase::Idle;
        report.training_step = self.training_step;

        tracing::info!(
            training_step = self.training_step,
            adapter = report.adapter_restored,
            optimizer = report.optimizer_restored,
            "Training state restored"
        );
        Ok(report)
    }
}
