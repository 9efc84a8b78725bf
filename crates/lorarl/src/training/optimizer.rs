//! Adam-family optimizers with persistable state.
//!
//! Moment buffers are plain tensors keyed by parameter name so they can be written to and
//! read back from a safetensors file.

use crate::{LoraRlError, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use tch::{Device, Kind, Tensor};

/// Trait for optimizers driven by the update engine.
pub trait PolicyOptimizer: Send {
    /// Zero out gradients.
    fn zero_grad(&mut self);

    /// Perform an optimization step.
    fn step(&mut self) -> Result<()>;

    /// Scale gradients so their global norm is at most `max_norm`; returns the norm before clipping.
    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64>;

    /// Number of steps taken.
    fn step_count(&self) -> i64;

    /// Names of the optimized parameters, sorted.
    fn parameter_names(&self) -> Vec<String>;

    /// Persist internal buffers.
    fn save_state(&self, path: &Path) -> Result<()>;

    /// Restore buffers saved by [`PolicyOptimizer::save_state`]; the state is untouched on error.
    fn load_state(&mut self, path: &Path) -> Result<()>;
}

/// Supported optimizer families.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerFamily {
    Adam,
    AdamW,
}

impl OptimizerFamily {
    /// L2 penalty for Adam, decoupled decay for AdamW.
    pub fn default_weight_decay(&self) -> f64 {
        match self {
            OptimizerFamily::Adam => 0.0,
            OptimizerFamily::AdamW => 0.01,
        }
    }
}

impl FromStr for OptimizerFamily {
    type Err = LoraRlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerFamily::Adam),
            "adamw" => Ok(OptimizerFamily::AdamW),
            _ => Err(LoraRlError::Configuration(format!(
                "unsupported optimizer family '{}', expected Adam or AdamW",
                s
            ))),
        }
    }
}

const STEP_KEY: &str = "step";

struct Slot {
    name: String,
    param: Tensor,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Adam or AdamW over a fixed, named parameter set.
pub struct AdamOptimizer {
    family: OptimizerFamily,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    step: i64,
    slots: Vec<Slot>,
}

impl AdamOptimizer {
    pub fn new(
        params: Vec<(String, Tensor)>,
        family: OptimizerFamily,
        lr: f64,
        weight_decay: Option<f64>,
    ) -> Result<Self> {
        let slots = params
            .into_iter()
            .map(|(name, param)| {
                Ok(Slot {
                    exp_avg: param.f_zeros_like()?,
                    exp_avg_sq: param.f_zeros_like()?,
                    name,
                    param,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            family,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: weight_decay.unwrap_or_else(|| family.default_weight_decay()),
            step: 0,
            slots,
        })
    }

    pub fn family(&self) -> OptimizerFamily {
        self.family
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    /// First moment buffer of a parameter.
    pub fn exp_avg(&self, name: &str) -> Option<&Tensor> {
        self.slots.iter().find(|s| s.name == name).map(|s| &s.exp_avg)
    }

    /// Second moment buffer of a parameter.
    pub fn exp_avg_sq(&self, name: &str) -> Option<&Tensor> {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.exp_avg_sq)
    }

    fn expected_keys(&self) -> BTreeSet<String> {
        self.slots
            .iter()
            .flat_map(|s| [format!("exp_avg.{}", s.name), format!("exp_avg_sq.{}", s.name)])
            .chain(std::iter::once(STEP_KEY.to_string()))
            .collect()
    }
}

impl PolicyOptimizer for AdamOptimizer {
    fn zero_grad(&mut self) {
        for slot in &mut self.slots {
            slot.param.zero_grad();
        }
    }

    fn step(&mut self) -> Result<()> {
        self.step += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);
        let step_size = self.lr / bias_correction1;
        let (beta1, beta2, eps, lr, wd, family) = (
            self.beta1,
            self.beta2,
            self.eps,
            self.lr,
            self.weight_decay,
            self.family,
        );

        tch::no_grad(|| -> Result<()> {
            for slot in &mut self.slots {
                let grad = slot.param.grad();
                if !grad.defined() {
                    continue;
                }

                let grad = match family {
                    OptimizerFamily::Adam if wd != 0.0 => {
                        grad.f_add(&slot.param.f_mul_scalar(wd)?)?
                    }
                    OptimizerFamily::AdamW if wd != 0.0 => {
                        slot.param.f_mul_scalar_(1.0 - lr * wd)?;
                        grad
                    }
                    _ => grad,
                };

                slot.exp_avg.f_mul_scalar_(beta1)?;
                slot.exp_avg.f_add_(&grad.f_mul_scalar(1.0 - beta1)?)?;
                slot.exp_avg_sq.f_mul_scalar_(beta2)?;
                slot.exp_avg_sq
                    .f_add_(&grad.f_mul(&grad)?.f_mul_scalar(1.0 - beta2)?)?;

                let denom = slot
                    .exp_avg_sq
                    .f_sqrt()?
                    .f_div_scalar(bias_correction2.sqrt())?
                    .f_add_scalar(eps)?;
                let update = slot.exp_avg.f_div(&denom)?.f_mul_scalar(step_size)?;
                slot.param.f_sub_(&update)?;
            }
            Ok(())
        })
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<f64> {
        let mut global_norm = 0.0f64;
        for slot in &self.slots {
            let grad = slot.param.grad();
            if grad.defined() {
                global_norm += grad
                    .f_pow_tensor_scalar(2.0)?
                    .f_sum(Kind::Float)?
                    .f_double_value(&[])?;
            }
        }
        global_norm = global_norm.sqrt();

        if global_norm > max_norm {
            let clip_coef = max_norm / (global_norm + 1e-6);
            for slot in &self.slots {
                let mut grad = slot.param.grad();
                if grad.defined() {
                    grad.f_mul_scalar_(clip_coef)?;
                }
            }
        }
        Ok(global_norm)
    }

    fn step_count(&self) -> i64 {
        self.step
    }

    fn parameter_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.iter().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    fn save_state(&self, path: &Path) -> Result<()> {
        let mut tensors: Vec<(String, Tensor)> = Vec::with_capacity(2 * self.slots.len() + 1);
        for slot in &self.slots {
            tensors.push((
                format!("exp_avg.{}", slot.name),
                slot.exp_avg.f_to_device(Device::Cpu)?,
            ));
            tensors.push((
                format!("exp_avg_sq.{}", slot.name),
                slot.exp_avg_sq.f_to_device(Device::Cpu)?,
            ));
        }
        tensors.push((STEP_KEY.to_string(), Tensor::from_slice(&[self.step])));
        Tensor::write_safetensors(&tensors, path)?;
        Ok(())
    }

    fn load_state(&mut self, path: &Path) -> Result<()> {
        let loaded: HashMap<String, Tensor> = Tensor::read_safetensors(path)?.into_iter().collect();

        let expected = self.expected_keys();
        let found: BTreeSet<String> = loaded.keys().cloned().collect();
        if expected != found {
            let missing: Vec<&String> = expected.difference(&found).collect();
            let unexpected: Vec<&String> = found.difference(&expected).collect();
            return Err(LoraRlError::Checkpoint(format!(
                "optimizer state parameters do not match: missing {:?}, unexpected {:?}",
                missing, unexpected
            )));
        }

        for slot in &self.slots {
            for (key, buffer) in [
                (format!("exp_avg.{}", slot.name), &slot.exp_avg),
                (format!("exp_avg_sq.{}", slot.name), &slot.exp_avg_sq),
            ] {
                let saved = &loaded[&key];
                if saved.size() != buffer.size() {
                    return Err(LoraRlError::Checkpoint(format!(
                        "optimizer buffer '{}' has shape {:?}, expected {:?}",
                        key,
                        saved.size(),
                        buffer.size()
                    )));
                }
            }
        }
        let step = loaded[STEP_KEY].f_int64_value(&[0])?;

        tch::no_grad(|| -> Result<()> {
            for slot in &mut self.slots {
                let device = slot.exp_avg.device();
                let kind = slot.exp_avg.kind();
                slot.exp_avg.f_copy_(
                    &loaded[&format!("exp_avg.{}", slot.name)].f_to_device(device)?.f_to_kind(kind)?,
                )?;
                slot.exp_avg_sq.f_copy_(
                    &loaded[&format!("exp_avg_sq.{}", slot.name)]
                        .f_to_device(device)?
                        .f_to_kind(kind)?,
                )?;
            }
            Ok(())
        })?;
        self.step = step;
        Ok(())
    }
}
