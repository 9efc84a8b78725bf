//! Language models.
//!
//! Provides:
//! - `BaseModel` - frozen decoder-only transformer loaded from a model directory
//! - `LoraLanguageModel` - base model plus trainable low-rank adapter
//! - Logprob-capturing generation for policy-gradient training

mod config;
mod generate;
mod lora;
mod lora_model;
mod memory;
mod tokenizer;
mod transformer;

pub use config::{BaseModelConfig, DevicePlacement, LoraConfig, Precision, SUPPORTED_TARGET_MODULES};
pub use generate::{GenerationOptions, GenerationOutput};
pub use lora::{LoraAdapter, LoraLinear, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
pub use lora_model::{AdapterSource, LoraLanguageModel};
pub use memory::{is_out_of_memory, MemoryProbe, TorchMemoryProbe};
pub use tokenizer::{ChatTokenizer, EncodedBatch, PaddingGuard, RoleDict};
pub use transformer::{
    BaseModel, CausalTransformer, MODEL_CONFIG_FILE, MODEL_WEIGHTS_FILE, TOKENIZER_FILE,
};

use crate::session::{ChatHistory, ChatHistoryItem};
use crate::Result;
use std::path::Path;
use tch::Tensor;

/// Whether adapter dropout is active and generation may track gradients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelMode {
    Train,
    #[default]
    Eval,
}

/// Trait for chat language models
pub trait LanguageModel: Send {
    fn role_dict(&self) -> &RoleDict;

    /// Generate one agent response per conversation, without gradient tracking.
    fn inference(
        &mut self,
        batch: &[ChatHistory],
        options: &GenerationOptions,
        system_prompt: &str,
    ) -> Result<Vec<ChatHistoryItem>>;
}

/// Trait for language models that can be trained by policy gradient
pub trait PolicyModel: LanguageModel {
    /// Generate responses together with the summed log-probability of each.
    ///
    /// In [`ModelMode::Train`] the log-probabilities stay attached to the adapter's graph.
    fn generate_with_logprob(
        &mut self,
        batch: &[ChatHistory],
        options: &GenerationOptions,
        system_prompt: &str,
    ) -> Result<GenerationOutput>;

    fn set_mode(&mut self, mode: ModelMode);

    fn mode(&self) -> ModelMode;

    /// Named trainable tensors, sorted by name.
    fn trainable_parameters(&self) -> Vec<(String, Tensor)>;

    /// Save adapter weights and configuration into a directory.
    fn save_adapter(&self, dir: &Path) -> Result<()>;

    /// Replace adapter weights with those saved in a directory.
    fn load_adapter(&mut self, dir: &Path) -> Result<()>;
}
