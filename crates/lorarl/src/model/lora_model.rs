//! Frozen base model with a trainable low-rank adapter.

use super::config::LoraConfig;
use super::generate::{self, GenerationOptions, GenerationOutput};
use super::lora::LoraAdapter;
use super::memory::{is_out_of_memory, MemoryProbe, TorchMemoryProbe};
use super::tokenizer::{ChatTokenizer, RoleDict};
use super::transformer::{BaseModel, CausalTransformer};
use super::{LanguageModel, ModelMode, PolicyModel};
use crate::session::{ChatHistory, ChatHistoryItem, Role};
use crate::utils::abbreviate;
use crate::{LoraRlError, Result};
use std::path::{Path, PathBuf};
use tch::{Device, Tensor};
use tokenizers::Tokenizer;

/// Where the adapter comes from.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum AdapterSource {
    /// Fresh adapter with [`LoraConfig::default`]
    #[default]
    Default,
    /// Fresh adapter with the given configuration
    Config(LoraConfig),
    /// Adapter saved in a directory
    Checkpoint(PathBuf),
}

impl AdapterSource {
    /// Prefer an existing checkpoint, then an explicit configuration, then the default.
    pub fn resolve(checkpoint: Option<PathBuf>, config: Option<LoraConfig>) -> Self {
        match (checkpoint, config) {
            (Some(path), _) if path.exists() => AdapterSource::Checkpoint(path),
            (checkpoint, config) => {
                if let Some(path) = checkpoint {
                    tracing::warn!(path = %path.display(), "Adapter checkpoint not found, creating a fresh adapter");
                }
                config.map(AdapterSource::Config).unwrap_or_default()
            }
        }
    }
}

/// Chat model whose only trainable weights are a LoRA adapter.
pub struct LoraLanguageModel {
    transformer: CausalTransformer,
    adapter: LoraAdapter,
    tokenizer: ChatTokenizer,
    mode: ModelMode,
    memory_probe: Box<dyn MemoryProbe>,
}

impl LoraLanguageModel {
    pub fn new(base: BaseModel, role_dict: RoleDict, source: AdapterSource) -> Result<Self> {
        let BaseModel {
            transformer,
            tokenizer,
        } = base;
        let device = transformer.device();

        let adapter = match source {
            AdapterSource::Default => {
                LoraAdapter::new(transformer.config(), LoraConfig::default(), device)?
            }
            AdapterSource::Config(config) => LoraAdapter::new(transformer.config(), config, device)?,
            AdapterSource::Checkpoint(path) => {
                tracing::info!(path = %path.display(), "Loading adapter checkpoint");
                LoraAdapter::from_pretrained(&path, transformer.config(), device)?
            }
        };

        let model = Self {
            transformer,
            adapter,
            tokenizer: ChatTokenizer::new(tokenizer, role_dict),
            mode: ModelMode::Eval,
            memory_probe: Box::new(TorchMemoryProbe::default()),
        };

        let trainable = model.num_trainable_parameters();
        let total = trainable + model.transformer.num_parameters();
        tracing::info!(
            trainable = %abbreviate(trainable),
            total = %abbreviate(total),
            trainable_pct = 100.0 * trainable as f64 / total.max(1) as f64,
            rank = model.adapter.config().r,
            "Adapter attached"
        );

        Ok(model)
    }

    /// Replace the memory probe.
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn device(&self) -> Device {
        self.transformer.device()
    }

    pub fn base_config(&self) -> &super::BaseModelConfig {
        self.transformer.config()
    }

    pub fn lora_config(&self) -> &LoraConfig {
        self.adapter.config()
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        self.tokenizer.tokenizer()
    }

    pub fn tokenizer_mut(&mut self) -> &mut Tokenizer {
        self.tokenizer.tokenizer_mut()
    }

    pub fn num_trainable_parameters(&self) -> i64 {
        self.adapter.num_parameters()
    }

    fn run_generation(
        &mut self,
        batch: &[ChatHistory],
        options: &GenerationOptions,
        system_prompt: &str,
        track_grad: bool,
    ) -> Result<(Vec<ChatHistoryItem>, Vec<Tensor>)> {
        options.validate()?;
        let device = self.transformer.device();
        let eos_id = self.transformer.config().eos_token_id;
        let max_positions = self.transformer.config().max_position_embeddings;
        let train = self.mode == ModelMode::Train;

        let prompts: Vec<String> = batch
            .iter()
            .map(|history| self.tokenizer.render(history, system_prompt))
            .collect();

        let padded = self.tokenizer.left_padding(eos_id as u32)?;
        let encoded = padded.encode_batch(prompts)?;
        if encoded.seq_len as i64 >= max_positions {
            return Err(LoraRlError::ContextLimit {
                prompt_len: encoded.seq_len,
                max_positions: max_positions as usize,
            });
        }
        let (input_ids, attention_mask) = encoded.to_tensors(device)?;

        let _grad_guard = (!(track_grad && train)).then(tch::no_grad_guard);
        self.memory_probe.synchronize(device);
        let decoded = generate::decode_with_logprob(
            &self.transformer,
            &self.adapter,
            &input_ids,
            &attention_mask,
            options,
            train,
        );
        self.memory_probe.synchronize(device);
        let decoded =
            decoded.map_err(|err| classify_generation_error(err, &*self.memory_probe, device))?;

        let mut responses = Vec::with_capacity(batch.len());
        let mut logprobs = Vec::with_capacity(batch.len());
        for row in 0..encoded.batch_size as i64 {
            let ids = generate::response_ids(&decoded.tokens, row, eos_id)?;
            let text = padded
                .decode(&ids, true)
                .map_err(|e| LoraRlError::Tokenizer(e.to_string()))?;
            responses.push(ChatHistoryItem::new(Role::Agent, text.trim()));
            logprobs.push(decoded.logprobs.f_select(0, row)?);
        }

        Ok((responses, logprobs))
    }
}

/// Map a failed generation to [`LoraRlError::MemoryExhaustion`] when memory is the cause.
fn classify_generation_error(
    err: LoraRlError,
    probe: &dyn MemoryProbe,
    device: Device,
) -> LoraRlError {
    let oom = matches!(&err, LoraRlError::TensorError(e) if is_out_of_memory(e));
    if oom || probe.is_saturated(device) {
        probe.settle_after_exhaustion(device);
        tracing::warn!(error = %err, "Generation ran out of device memory");
        LoraRlError::MemoryExhaustion(err.to_string())
    } else {
        err
    }
}

impl LanguageModel for LoraLanguageModel {
    fn role_dict(&self) -> &RoleDict {
        self.tokenizer.role_dict()
    }

    fn inference(
        &mut self,
        batch: &[ChatHistory],
        options: &GenerationOptions,
        system_prompt: &str,
    ) -> Result<Vec<ChatHistoryItem>> {
        let (responses, _) = self.run_generation(batch, options, system_prompt, false)?;
        Ok(responses)
    }
}

impl PolicyModel for LoraLanguageModel {
    fn generate_with_logprob(
        &mut self,
        batch: &[ChatHistory],
        options: &GenerationOptions,
        system_prompt: &str,
    ) -> Result<GenerationOutput> {
        let (responses, logprobs) = self.run_generation(batch, options, system_prompt, true)?;
        Ok(GenerationOutput {
            responses,
            logprobs,
        })
    }

    fn set_mode(&mut self, mode: ModelMode) {
        self.mode = mode;
    }

    fn mode(&self) -> ModelMode {
        self.mode
    }

    fn trainable_parameters(&self) -> Vec<(String, Tensor)> {
        self.adapter.named_parameters()
    }

    fn save_adapter(&self, dir: &Path) -> Result<()> {
        self.adapter.save(dir)
    }

    fn load_adapter(&mut self, dir: &Path) -> Result<()> {
        self.adapter.load(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_lora_model;

    #[derive(Default)]
    struct SaturatedProbe {
        settled: std::cell::Cell<usize>,
    }

    impl MemoryProbe for SaturatedProbe {
        fn synchronize(&self, _device: Device) {}

        fn is_saturated(&self, _device: Device) -> bool {
            true
        }

        fn settle_after_exhaustion(&self, _device: Device) {
            self.settled.set(self.settled.get() + 1);
        }
    }

    #[test]
    fn test_resolve_adapter_source() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().to_path_buf();
        let missing = dir.path().join("missing");
        let config = LoraConfig::default().with_rank(4);

        assert_eq!(
            AdapterSource::resolve(Some(existing.clone()), Some(config.clone())),
            AdapterSource::Checkpoint(existing)
        );
        assert_eq!(
            AdapterSource::resolve(Some(missing), Some(config.clone())),
            AdapterSource::Config(config)
        );
        assert_eq!(AdapterSource::resolve(None, None), AdapterSource::Default);
    }

    #[test]
    fn test_classify_generation_error() {
        let oom = LoraRlError::TensorError(tch::TchError::Torch(
            "CUDA out of memory".to_string(),
        ));
        let probe = TorchMemoryProbe::default();
        assert!(matches!(
            classify_generation_error(oom, &probe, Device::Cpu),
            LoraRlError::MemoryExhaustion(_)
        ));

        let other = LoraRlError::InvalidState("boom".to_string());
        assert!(matches!(
            classify_generation_error(other, &probe, Device::Cpu),
            LoraRlError::InvalidState(_)
        ));

        let saturated = SaturatedProbe::default();
        let other = LoraRlError::InvalidState("boom".to_string());
        assert!(matches!(
            classify_generation_error(other, &saturated, Device::Cpu),
            LoraRlError::MemoryExhaustion(_)
        ));
        assert_eq!(saturated.settled.get(), 1);
    }

    #[test]
    fn test_device_settles_only_on_memory_errors() {
        struct CalmProbe(std::cell::Cell<usize>);

        impl MemoryProbe for CalmProbe {
            fn synchronize(&self, _device: Device) {}

            fn is_saturated(&self, _device: Device) -> bool {
                false
            }

            fn settle_after_exhaustion(&self, _device: Device) {
                self.0.set(self.0.get() + 1);
            }
        }

        let probe = CalmProbe(std::cell::Cell::new(0));
        classify_generation_error(LoraRlError::Tokenizer("bad".to_string()), &probe, Device::Cpu);
        assert_eq!(probe.0.get(), 0);

        let oom = LoraRlError::TensorError(tch::TchError::Torch("out of memory".to_string()));
        classify_generation_error(oom, &probe, Device::Cpu);
        assert_eq!(probe.0.get(), 1);
    }

    #[test]
    fn test_context_limit() {
        let mut model = tiny_lora_model(0, LoraConfig::default()).unwrap();
        let long = "hello ".repeat(64);
        let batch = vec![vec![ChatHistoryItem::new(Role::User, long)]];

        let result = model.inference(&batch, &GenerationOptions::default(), "");
        assert!(matches!(result, Err(LoraRlError::ContextLimit { .. })));
        assert!(model.tokenizer().get_padding().is_none());
    }

    #[test]
    fn test_starts_in_eval_mode() {
        let mut model = tiny_lora_model(0, LoraConfig::default()).unwrap();
        assert_eq!(model.mode(), ModelMode::Eval);
        model.set_mode(ModelMode::Train);
        assert_eq!(model.mode(), ModelMode::Train);
        assert!(!model.trainable_parameters().is_empty());
    }
}
