//! Low-rank adapter layers.
//!
//! The adapter owns its own `VarStore`, separate from the frozen base weights, so it can be
//! optimized, saved and restored on its own.

use super::config::{BaseModelConfig, LoraConfig};
use crate::{LoraRlError, Result};
use std::collections::HashMap;
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

/// File holding adapter weights inside an adapter directory.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// File holding the adapter configuration inside an adapter directory.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Low-rank update `scaling * B(A(dropout(x)))` for one projection.
pub struct LoraLinear {
    lora_a: Tensor,
    lora_b: Tensor,
    scaling: f64,
    dropout: f64,
}

impl LoraLinear {
    /// `A` is uniform in `±1/sqrt(in_features)`, `B` starts at zero.
    pub fn new(path: nn::Path, in_features: i64, out_features: i64, config: &LoraConfig) -> Self {
        let bound = 1.0 / (in_features as f64).sqrt();
        let lora_a = (&path / "lora_A").var(
            "weight",
            &[config.r, in_features],
            nn::Init::Uniform {
                lo: -bound,
                up: bound,
            },
        );
        let lora_b = (&path / "lora_B").var("weight", &[out_features, config.r], nn::Init::Const(0.0));

        Self {
            lora_a,
            lora_b,
            scaling: config.scaling(),
            dropout: config.lora_dropout,
        }
    }

    /// Adapter contribution for `x`, returned in the kind of `x`.
    pub fn delta(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = x.f_to_kind(Kind::Float)?.f_dropout(self.dropout, train)?;
        let update = hidden
            .f_linear::<&Tensor>(&self.lora_a, None)?
            .f_linear::<&Tensor>(&self.lora_b, None)?
            .f_mul_scalar(self.scaling)?;
        Ok(update.f_to_kind(x.kind())?)
    }
}

/// Section of a transformer block a projection belongs to.
fn module_section(module: &str) -> &'static str {
    match module {
        "up_proj" | "down_proj" => "mlp",
        _ => "self_attn",
    }
}

/// Trainable adapter attached to every targeted projection of every layer.
pub struct LoraAdapter {
    vs: nn::VarStore,
    config: LoraConfig,
    layers: Vec<HashMap<String, LoraLinear>>,
}

impl LoraAdapter {
    /// Fresh adapter for a base model architecture.
    pub fn new(base: &BaseModelConfig, config: LoraConfig, device: Device) -> Result<Self> {
        config.validate()?;

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let mut layers = Vec::with_capacity(base.num_hidden_layers);

        for layer_idx in 0..base.num_hidden_layers {
            let mut modules = HashMap::new();
            for module in &config.target_modules {
                let (in_features, out_features) =
                    base.projection_shape(module).ok_or_else(|| {
                        LoraRlError::Configuration(format!("unknown LoRA target module '{}'", module))
                    })?;
                let path = &root / "layers" / layer_idx / module_section(module) / module.as_str();
                modules.insert(
                    module.clone(),
                    LoraLinear::new(path, in_features, out_features, &config),
                );
            }
            layers.push(modules);
        }

        Ok(Self { vs, config, layers })
    }

    /// Adapter built from the configuration saved in `dir`, then loaded with its weights.
    pub fn from_pretrained(
        dir: impl AsRef<Path>,
        base: &BaseModelConfig,
        device: Device,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let config = LoraConfig::from_file(dir.join(ADAPTER_CONFIG_FILE))?;
        let mut adapter = Self::new(base, config, device)?;
        adapter.load(dir)?;
        Ok(adapter)
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Adapter of `module` in `layer`, if targeted.
    pub fn get(&self, layer: usize, module: &str) -> Option<&LoraLinear> {
        self.layers.get(layer).and_then(|modules| modules.get(module))
    }

    /// Named adapter parameters sorted by name.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params: Vec<(String, Tensor)> = self
            .vs
            .variables()
            .into_iter()
            .filter(|(_, tensor)| tensor.requires_grad())
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    pub fn num_parameters(&self) -> i64 {
        self.vs.variables().values().map(|v| v.numel() as i64).sum()
    }

    /// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.vs.save(dir.join(ADAPTER_WEIGHTS_FILE))?;
        self.config.save(dir.join(ADAPTER_CONFIG_FILE))?;
        tracing::debug!(path = %dir.display(), "Saved adapter");
        Ok(())
    }

    /// Load weights saved by [`LoraAdapter::save`] into this adapter.
    pub fn load(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let saved = LoraConfig::from_file(dir.join(ADAPTER_CONFIG_FILE))?;
        if saved.r != self.config.r || saved.target_modules != self.config.target_modules {
            return Err(LoraRlError::Checkpoint(format!(
                "adapter at {} has rank {} on {:?}, expected rank {} on {:?}",
                dir.display(),
                saved.r,
                saved.target_modules,
                self.config.r,
                self.config.target_modules
            )));
        }
        // scaling is baked into every layer at construction
        if saved.lora_alpha != self.config.lora_alpha {
            return Err(LoraRlError::Checkpoint(format!(
                "adapter at {} has lora_alpha {}, expected {}",
                dir.display(),
                saved.lora_alpha,
                self.config.lora_alpha
            )));
        }
        self.vs.load(dir.join(ADAPTER_WEIGHTS_FILE))?;
        tracing::debug!(path = %dir.display(), "Loaded adapter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_base_config;

    #[test]
    fn test_fresh_adapter_has_zero_delta() {
        let adapter = LoraAdapter::new(&tiny_base_config(), LoraConfig::default(), Device::Cpu)
            .unwrap();
        let lora = adapter.get(0, "q_proj").unwrap();
        let x = Tensor::randn([2, 3, 16], (Kind::Float, Device::Cpu));
        let delta = lora.delta(&x, false).unwrap();
        assert_eq!(delta.size(), [2, 3, 16]);
        assert_eq!(delta.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn test_parameters_are_named_and_sorted() {
        let config = LoraConfig::default()
            .with_rank(2)
            .with_target_modules(["q_proj", "up_proj"]);
        let adapter = LoraAdapter::new(&tiny_base_config(), config, Device::Cpu).unwrap();
        let params = adapter.named_parameters();

        // two layers, two modules, A and B each
        assert_eq!(params.len(), 8);
        let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"layers.0.self_attn.q_proj.lora_A.weight"));
        assert!(names.contains(&"layers.1.mlp.up_proj.lora_B.weight"));
        assert!(adapter.get(0, "v_proj").is_none());
    }

    #[test]
    fn test_save_and_load_adapter() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny_base_config();
        let config = LoraConfig::default().with_rank(4);

        let source = LoraAdapter::new(&base, config.clone(), Device::Cpu).unwrap();
        tch::no_grad(|| {
            for (_, mut tensor) in source.named_parameters() {
                let _ = tensor.fill_(0.25);
            }
        });
        source.save(dir.path()).unwrap();

        let restored = LoraAdapter::from_pretrained(dir.path(), &base, Device::Cpu).unwrap();
        assert_eq!(restored.config(), &config);
        for ((name_a, a), (name_b, b)) in source
            .named_parameters()
            .iter()
            .zip(restored.named_parameters().iter())
        {
            assert_eq!(name_a, name_b);
            assert!(a.allclose(b, 0.0, 0.0, false));
        }
    }

    #[test]
    fn test_load_rejects_mismatched_rank() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny_base_config();
        LoraAdapter::new(&base, LoraConfig::default().with_rank(4), Device::Cpu)
            .unwrap()
            .save(dir.path())
            .unwrap();

        let mut other = LoraAdapter::new(&base, LoraConfig::default().with_rank(8), Device::Cpu)
            .unwrap();
        assert!(matches!(
            other.load(dir.path()),
            Err(LoraRlError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_load_rejects_mismatched_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny_base_config();
        LoraAdapter::new(&base, LoraConfig::default().with_alpha(8.0), Device::Cpu)
            .unwrap()
            .save(dir.path())
            .unwrap();

        let mut other = LoraAdapter::new(&base, LoraConfig::default(), Device::Cpu).unwrap();
        assert!(matches!(
            other.load(dir.path()),
            Err(LoraRlError::Checkpoint(_))
        ));

        // building from the checkpoint picks up the saved scaling
        let restored = LoraAdapter::from_pretrained(dir.path(), &base, Device::Cpu).unwrap();
        assert_eq!(restored.config().lora_alpha, 8.0);
        assert_eq!(restored.get(0, "q_proj").unwrap().scaling, 0.5);
    }
}
