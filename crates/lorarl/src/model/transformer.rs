//! Frozen decoder-only transformer.
//!
//! Learned absolute positions, pre-norm blocks with multi-head attention and a GELU MLP,
//! final layer norm and an untied `lm_head`. Every projection can carry a LoRA update.

use super::config::{BaseModelConfig, DevicePlacement, Precision};
use super::lora::LoraAdapter;
use crate::{LoraRlError, Result};
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};
use tokenizers::Tokenizer;

/// Weights file inside a base model directory.
pub const MODEL_WEIGHTS_FILE: &str = "model.safetensors";
/// Architecture file inside a base model directory.
pub const MODEL_CONFIG_FILE: &str = "config.json";
/// Tokenizer file inside a base model directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    fn new(path: nn::Path, dim: i64) -> Self {
        Self {
            weight: path.var("weight", &[dim], nn::Init::Const(1.0)),
            bias: path.var("bias", &[dim], nn::Init::Const(0.0)),
        }
    }

    fn forward(&self, x: &Tensor, eps: f64) -> Result<Tensor> {
        let dim = self.weight.size()[0];
        Ok(x.f_layer_norm([dim], Some(&self.weight), Some(&self.bias), eps, true)?)
    }
}

struct Projection {
    weight: Tensor,
    bias: Tensor,
}

impl Projection {
    fn new(path: nn::Path, in_features: i64, out_features: i64) -> Self {
        Self {
            weight: path.var(
                "weight",
                &[out_features, in_features],
                nn::Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            ),
            bias: path.var("bias", &[out_features], nn::Init::Const(0.0)),
        }
    }
}

struct Block {
    input_layernorm: LayerNorm,
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    post_attention_layernorm: LayerNorm,
    up_proj: Projection,
    down_proj: Projection,
}

impl Block {
    fn new(path: nn::Path, config: &BaseModelConfig) -> Self {
        let h = config.hidden_size;
        let attn = &path / "self_attn";
        let mlp = &path / "mlp";
        Self {
            input_layernorm: LayerNorm::new(&path / "input_layernorm", h),
            q_proj: Projection::new(&attn / "q_proj", h, h),
            k_proj: Projection::new(&attn / "k_proj", h, h),
            v_proj: Projection::new(&attn / "v_proj", h, h),
            o_proj: Projection::new(&attn / "o_proj", h, h),
            post_attention_layernorm: LayerNorm::new(&path / "post_attention_layernorm", h),
            up_proj: Projection::new(&mlp / "up_proj", h, config.intermediate_size),
            down_proj: Projection::new(&mlp / "down_proj", config.intermediate_size, h),
        }
    }
}

/// Decoder stack with its frozen weights.
pub struct CausalTransformer {
    vs: nn::VarStore,
    config: BaseModelConfig,
    embed_tokens: Tensor,
    embed_positions: Tensor,
    layers: Vec<Block>,
    norm: LayerNorm,
    lm_head: Tensor,
}

impl CausalTransformer {
    fn build(config: BaseModelConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let init = nn::Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };

        let embed_tokens =
            (&root / "embed_tokens").var("weight", &[config.vocab_size, config.hidden_size], init);
        let embed_positions = (&root / "embed_positions").var(
            "weight",
            &[config.max_position_embeddings, config.hidden_size],
            init,
        );
        let layers = (0..config.num_hidden_layers)
            .map(|i| Block::new(&root / "layers" / i, &config))
            .collect();
        let norm = LayerNorm::new(&root / "norm", config.hidden_size);
        let lm_head =
            (&root / "lm_head").var("weight", &[config.vocab_size, config.hidden_size], init);

        Ok(Self {
            vs,
            config,
            embed_tokens,
            embed_positions,
            layers,
            norm,
            lm_head,
        })
    }

    fn finalize(mut self, precision: Precision) -> Self {
        self.vs.set_kind(precision.kind());
        self.vs.freeze();
        self
    }

    pub fn config(&self) -> &BaseModelConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn kind(&self) -> Kind {
        self.embed_tokens.kind()
    }

    pub fn num_parameters(&self) -> i64 {
        self.vs.variables().values().map(|v| v.numel() as i64).sum()
    }

    /// Logits `[batch, seq, vocab]` for left-padded `input_ids` with `attention_mask`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        adapter: &LoraAdapter,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.size2()?;
        if seq_len > self.config.max_position_embeddings {
            return Err(LoraRlError::ContextLimit {
                prompt_len: seq_len as usize,
                max_positions: self.config.max_position_embeddings as usize,
            });
        }

        let positions = attention_mask
            .f_cumsum(-1, Kind::Int64)?
            .f_sub_scalar(1)?
            .f_clamp_min(0)?;
        let mut hidden = Tensor::f_embedding(&self.embed_tokens, input_ids, -1, false, false)?
            .f_add(&Tensor::f_embedding(
                &self.embed_positions,
                &positions,
                -1,
                false,
                false,
            )?)?;

        let blocked = blocked_attention(attention_mask, batch, seq_len)?;
        let eps = self.config.layer_norm_eps;

        for (idx, block) in self.layers.iter().enumerate() {
            let normed = block.input_layernorm.forward(&hidden, eps)?;
            let attn = self.attention(idx, block, &normed, &blocked, adapter, train)?;
            hidden = hidden.f_add(&attn)?;

            let normed = block.post_attention_layernorm.forward(&hidden, eps)?;
            let up = project(idx, "up_proj", &block.up_proj, &normed, adapter, train)?
                .f_gelu("none")?;
            let down = project(idx, "down_proj", &block.down_proj, &up, adapter, train)?;
            hidden = hidden.f_add(&down)?;
        }

        let hidden = self.norm.forward(&hidden, eps)?;
        Ok(hidden.f_linear::<&Tensor>(&self.lm_head, None)?)
    }

    fn attention(
        &self,
        idx: usize,
        block: &Block,
        x: &Tensor,
        blocked: &Tensor,
        adapter: &LoraAdapter,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = x.size3()?;
        let heads = self.config.num_attention_heads;
        let head_dim = self.config.head_dim();

        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.f_view([batch, seq_len, heads, head_dim])?.f_transpose(1, 2)?)
        };
        let q = split(project(idx, "q_proj", &block.q_proj, x, adapter, train)?)?;
        let k = split(project(idx, "k_proj", &block.k_proj, x, adapter, train)?)?;
        let v = split(project(idx, "v_proj", &block.v_proj, x, adapter, train)?)?;

        let scores = q
            .f_matmul(&k.f_transpose(-2, -1)?)?
            .f_div_scalar((head_dim as f64).sqrt())?
            .f_masked_fill(blocked, f64::NEG_INFINITY)?;
        let probs = scores.f_softmax(-1, Kind::Float)?.f_to_kind(v.kind())?;
        let context = probs
            .f_matmul(&v)?
            .f_transpose(1, 2)?
            .f_contiguous()?
            .f_view([batch, seq_len, self.config.hidden_size])?;

        project(idx, "o_proj", &block.o_proj, &context, adapter, train)
    }
}

/// Frozen projection plus the adapter update attached to it, if any.
fn project(
    layer: usize,
    module: &str,
    proj: &Projection,
    x: &Tensor,
    adapter: &LoraAdapter,
    train: bool,
) -> Result<Tensor> {
    let out = x.f_linear(&proj.weight, Some(&proj.bias))?;
    match adapter.get(layer, module) {
        Some(lora) => Ok(out.f_add(&lora.delta(x, train)?)?),
        None => Ok(out),
    }
}

/// `[batch, 1, seq, seq]` mask of attention links to block.
///
/// A query attends to earlier non-padding keys and always to itself, so fully padded
/// prefixes never produce an all-masked row.
fn blocked_attention(attention_mask: &Tensor, batch: i64, seq_len: i64) -> Result<Tensor> {
    let device = attention_mask.device();
    let causal = Tensor::f_ones([seq_len, seq_len], (Kind::Bool, device))?.f_tril(0)?;
    let keys = attention_mask
        .f_to_kind(Kind::Bool)?
        .f_view([batch, 1, 1, seq_len])?;
    let diagonal = Tensor::f_eye(seq_len, (Kind::Bool, device))?;
    let allowed = causal.f_logical_and(&keys)?.f_logical_or(&diagonal)?;
    Ok(allowed.f_logical_not()?)
}

/// Frozen base model and its tokenizer.
pub struct BaseModel {
    pub(crate) transformer: CausalTransformer,
    pub(crate) tokenizer: Tokenizer,
}

impl BaseModel {
    /// Load `config.json`, `model.safetensors` and `tokenizer.json` from a model directory.
    pub fn from_pretrained(
        dir: impl AsRef<Path>,
        precision: Precision,
        placement: DevicePlacement,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let config = BaseModelConfig::from_file(dir.join(MODEL_CONFIG_FILE))?;
        let tokenizer = Tokenizer::from_file(dir.join(TOKENIZER_FILE))
            .map_err(|e| LoraRlError::Tokenizer(e.to_string()))?;

        let mut transformer = CausalTransformer::build(config, placement.device())?;
        transformer.vs.load(dir.join(MODEL_WEIGHTS_FILE))?;

        tracing::info!(
            path = %dir.display(),
            layers = transformer.config.num_hidden_layers,
            hidden_size = transformer.config.hidden_size,
            precision = ?precision,
            "Loaded base model"
        );

        Ok(Self {
            transformer: transformer.finalize(precision),
            tokenizer,
        })
    }

    /// Randomly initialized model for a given architecture.
    pub fn from_config(
        config: BaseModelConfig,
        tokenizer: Tokenizer,
        precision: Precision,
        placement: DevicePlacement,
    ) -> Result<Self> {
        let transformer = CausalTransformer::build(config, placement.device())?;
        Ok(Self {
            transformer: transformer.finalize(precision),
            tokenizer,
        })
    }

    pub fn config(&self) -> &BaseModelConfig {
        &self.transformer.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Write the model directory layout read by [`BaseModel::from_pretrained`].
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let file = std::fs::File::create(dir.join(MODEL_CONFIG_FILE))?;
        serde_json::to_writer_pretty(file, &self.transformer.config)?;
        self.transformer.vs.save(dir.join(MODEL_WEIGHTS_FILE))?;
        self.tokenizer
            .save(dir.join(TOKENIZER_FILE), true)
            .map_err(|e| LoraRlError::Tokenizer(e.to_string()))?;
        Ok(())
    }
}
