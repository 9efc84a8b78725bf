//! Base model, adapter, precision and device configuration.

use crate::{LoraRlError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tch::{Device, Kind};

/// Projection sub-modules an adapter can be attached to.
pub const SUPPORTED_TARGET_MODULES: [&str; 6] =
    ["q_proj", "k_proj", "v_proj", "o_proj", "up_proj", "down_proj"];

/// Architecture of the frozen base model (`config.json` of a model directory).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaseModelConfig {
    pub vocab_size: i64,
    pub hidden_size: i64,
    pub num_hidden_layers: usize,
    pub num_attention_heads: i64,
    pub intermediate_size: i64,
    pub max_position_embeddings: i64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    pub eos_token_id: i64,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

impl BaseModelConfig {
    /// Read `config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("intermediate_size", self.intermediate_size),
        ] {
            if value <= 0 {
                return Err(LoraRlError::Configuration(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.num_hidden_layers == 0 {
            return Err(LoraRlError::Configuration(
                "num_hidden_layers must be positive".to_string(),
            ));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(LoraRlError::Configuration(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.eos_token_id < 0 || self.eos_token_id >= self.vocab_size {
            return Err(LoraRlError::Configuration(format!(
                "eos_token_id {} outside vocabulary of size {}",
                self.eos_token_id, self.vocab_size
            )));
        }
        if self.max_position_embeddings <= 0 {
            return Err(LoraRlError::Configuration(
                "max_position_embeddings must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> i64 {
        self.hidden_size / self.num_attention_heads
    }

    /// Input and output features of a named projection.
    pub fn projection_shape(&self, module: &str) -> Option<(i64, i64)> {
        match module {
            "q_proj" | "k_proj" | "v_proj" | "o_proj" => Some((self.hidden_size, self.hidden_size)),
            "up_proj" => Some((self.hidden_size, self.intermediate_size)),
            "down_proj" => Some((self.intermediate_size, self.hidden_size)),
            _ => None,
        }
    }
}

/// Low-rank adapter hyperparameters (`adapter_config.json`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the update matrices
    pub r: i64,
    /// Scaling numerator; the update is scaled by `lora_alpha / r`
    pub lora_alpha: f64,
    /// Dropout applied to the adapter input in train mode
    pub lora_dropout: f64,
    /// Projections receiving an adapter
    pub target_modules: Vec<String>,
    /// Bias mode; only `"none"` is supported
    pub bias: String,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            lora_alpha: 32.0,
            lora_dropout: 0.1,
            target_modules: ["q_proj", "v_proj", "k_proj", "o_proj"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            bias: "none".to_string(),
        }
    }
}

impl LoraConfig {
    /// Set rank.
    pub fn with_rank(mut self, r: i64) -> Self {
        self.r = r;
        self
    }

    /// Set scaling numerator.
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.lora_alpha = alpha;
        self
    }

    /// Set dropout probability.
    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.lora_dropout = dropout;
        self
    }

    /// Set target modules.
    pub fn with_target_modules<S: Into<String>>(
        mut self,
        modules: impl IntoIterator<Item = S>,
    ) -> Self {
        self.target_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    pub fn validate(&self) -> Result<()> {
        if self.r <= 0 {
            return Err(LoraRlError::Configuration(format!(
                "LoRA rank must be positive, got {}",
                self.r
            )));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(LoraRlError::Configuration(format!(
                "LoRA dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if self.bias != "none" {
            return Err(LoraRlError::Configuration(format!(
                "unsupported LoRA bias mode '{}'",
                self.bias
            )));
        }
        if let Some(unknown) = self
            .target_modules
            .iter()
            .find(|m| !SUPPORTED_TARGET_MODULES.contains(&m.as_str()))
        {
            return Err(LoraRlError::Configuration(format!(
                "unknown LoRA target module '{}'",
                unknown
            )));
        }
        Ok(())
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Numeric precision of the frozen base weights.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float32,
    Float16,
    BFloat16,
}

impl Precision {
    pub fn kind(&self) -> Kind {
        match self {
            Precision::Float32 => Kind::Float,
            Precision::Float16 => Kind::Half,
            Precision::BFloat16 => Kind::BFloat16,
        }
    }
}

impl FromStr for Precision {
    type Err = LoraRlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Precision::Float32),
            "float16" | "fp16" | "f16" | "half" => Ok(Precision::Float16),
            "bfloat16" | "bf16" => Ok(Precision::BFloat16),
            other => Err(LoraRlError::Configuration(format!(
                "unknown precision '{}'",
                other
            ))),
        }
    }
}

/// Where the model is placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePlacement {
    /// First CUDA device when available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
}

impl DevicePlacement {
    pub fn device(&self) -> Device {
        match self {
            DevicePlacement::Auto => Device::cuda_if_available(),
            DevicePlacement::Cpu => Device::Cpu,
            DevicePlacement::Cuda(index) => Device::Cuda(*index),
        }
    }
}

impl FromStr for DevicePlacement {
    type Err = LoraRlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(DevicePlacement::Auto),
            "cpu" => Ok(DevicePlacement::Cpu),
            "cuda" => Ok(DevicePlacement::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse().ok())
                .map(DevicePlacement::Cuda)
                .ok_or_else(|| {
                    LoraRlError::Configuration(format!("unknown device placement '{}'", other))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lora_config() {
        let config = LoraConfig::default();
        assert_eq!(config.r, 16);
        assert_eq!(config.lora_alpha, 32.0);
        assert_eq!(config.lora_dropout, 0.1);
        assert_eq!(config.bias, "none");
        for module in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            assert!(config.targets(module));
        }
        assert!(!config.targets("up_proj"));
        assert_eq!(config.scaling(), 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lora_config_rejects_bad_values() {
        assert!(LoraConfig::default().with_rank(0).validate().is_err());
        assert!(LoraConfig::default().with_dropout(1.0).validate().is_err());
        assert!(LoraConfig::default()
            .with_target_modules(["gate_proj"])
            .validate()
            .is_err());

        let mut config = LoraConfig::default();
        config.bias = "all".to_string();
        assert!(matches!(
            config.validate(),
            Err(LoraRlError::Configuration(_))
        ));
    }

    #[test]
    fn test_lora_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adapter_config.json");
        let config = LoraConfig::default().with_rank(4).with_alpha(8.0);
        config.save(&path).unwrap();
        assert_eq!(LoraConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_base_config_validation() {
        let config = BaseModelConfig {
            vocab_size: 10,
            hidden_size: 12,
            num_hidden_layers: 1,
            num_attention_heads: 5,
            intermediate_size: 24,
            max_position_embeddings: 8,
            layer_norm_eps: 1e-5,
            eos_token_id: 1,
        };
        assert!(config.validate().is_err());

        let config = BaseModelConfig {
            num_attention_heads: 4,
            ..config
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 3);
        assert_eq!(config.projection_shape("up_proj"), Some((12, 24)));
        assert_eq!(config.projection_shape("lm_head"), None);
    }

    #[test]
    fn test_base_config_rejects_non_positive_sizes() {
        let valid = BaseModelConfig {
            vocab_size: 10,
            hidden_size: 12,
            num_hidden_layers: 1,
            num_attention_heads: 4,
            intermediate_size: 24,
            max_position_embeddings: 8,
            layer_norm_eps: 1e-5,
            eos_token_id: 1,
        };
        let broken = [
            BaseModelConfig { num_attention_heads: 0, ..valid.clone() },
            BaseModelConfig { hidden_size: 0, ..valid.clone() },
            BaseModelConfig { vocab_size: -1, ..valid.clone() },
            BaseModelConfig { intermediate_size: 0, ..valid.clone() },
            BaseModelConfig { num_hidden_layers: 0, ..valid.clone() },
        ];
        for config in &broken {
            assert!(
                matches!(config.validate(), Err(LoraRlError::Configuration(_))),
                "{:?}",
                config
            );
        }
    }

    #[test]
    fn test_base_config_file_with_zero_heads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"vocab_size": 10, "hidden_size": 12, "num_hidden_layers": 1,
                "num_attention_heads": 0, "intermediate_size": 24,
                "max_position_embeddings": 8, "eos_token_id": 1}"#,
        )
        .unwrap();
        assert!(matches!(
            BaseModelConfig::from_file(&path),
            Err(LoraRlError::Configuration(_))
        ));
    }

    #[test]
    fn test_parse_precision_and_device() {
        assert_eq!("bf16".parse::<Precision>().unwrap(), Precision::BFloat16);
        assert_eq!(Precision::Float16.kind(), Kind::Half);
        assert!("int8".parse::<Precision>().is_err());

        assert_eq!("cpu".parse::<DevicePlacement>().unwrap(), DevicePlacement::Cpu);
        assert_eq!(
            "cuda:1".parse::<DevicePlacement>().unwrap(),
            DevicePlacement::Cuda(1)
        );
        assert!("tpu".parse::<DevicePlacement>().is_err());
    }
}
