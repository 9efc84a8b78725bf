//! Autoregressive decoding with differentiable sequence log-probabilities.

use super::lora::LoraAdapter;
use super::transformer::CausalTransformer;
use crate::session::ChatHistoryItem;
use crate::{LoraRlError, Result};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

/// Decoding settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Upper bound on generated tokens per response
    pub max_new_tokens: usize,
    /// Sample from the processed distribution instead of taking the argmax
    pub do_sample: bool,
    /// Divides logits before sampling
    pub temperature: f64,
    /// Keep only the k most likely tokens when sampling
    pub top_k: Option<i64>,
    /// Seed for the torch generator, applied before decoding
    pub seed: Option<i64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            do_sample: false,
            temperature: 1.0,
            top_k: None,
            seed: None,
        }
    }
}

impl GenerationOptions {
    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_sampling(mut self, temperature: f64, top_k: Option<i64>) -> Self {
        self.do_sample = true;
        self.temperature = temperature;
        self.top_k = top_k;
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reject sampling settings that would divide logits by zero or keep no tokens.
    pub fn validate(&self) -> Result<()> {
        if !self.do_sample {
            return Ok(());
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(LoraRlError::Configuration(format!(
                "temperature must be positive when sampling, got {}",
                self.temperature
            )));
        }
        if let Some(k) = self.top_k {
            if k <= 0 {
                return Err(LoraRlError::Configuration(format!(
                    "top_k must be positive, got {}",
                    k
                )));
            }
        }
        Ok(())
    }
}

/// Responses and one scalar log-probability per batch element.
#[derive(Debug)]
pub struct GenerationOutput {
    pub responses: Vec<ChatHistoryItem>,
    pub logprobs: Vec<Tensor>,
}

/// Raw decoding result.
pub(crate) struct Decoded {
    /// `[batch, steps]` emitted token ids
    pub tokens: Tensor,
    /// `[batch]` summed log-probabilities of the emitted tokens
    pub logprobs: Tensor,
}

/// Scores the next token is chosen from: temperature and top-k when sampling,
/// raw logits otherwise.
fn process_scores(logits: &Tensor, options: &GenerationOptions) -> Result<Tensor> {
    let logits = logits.f_to_kind(Kind::Float)?;
    if !options.do_sample {
        return Ok(logits);
    }

    let mut scores = logits.f_div_scalar(options.temperature)?;
    if let Some(k) = options.top_k {
        let vocab = scores.size()[1];
        let k = k.clamp(1, vocab);
        let (values, _) = scores.f_topk(k, -1, true, true)?;
        let threshold = values.f_narrow(-1, k - 1, 1)?;
        let below = scores.f_lt_tensor(&threshold)?;
        scores = scores.f_masked_fill(&below, f64::NEG_INFINITY)?;
    }
    Ok(scores)
}

fn choose(scores: &Tensor, do_sample: bool) -> Result<Tensor> {
    let scores = scores.detach();
    if do_sample {
        Ok(scores
            .f_softmax(-1, Kind::Float)?
            .f_multinomial(1, false)?
            .f_squeeze_dim(-1)?)
    } else {
        Ok(scores.f_argmax(-1, false)?)
    }
}

/// Decode from a left-padded prompt batch.
///
/// A row stops at its first EOS; that token is scored, later filler steps are not.
/// Decoding ends when every row has stopped, after `max_new_tokens` steps, or when the
/// sequence would outgrow the position table.
pub(crate) fn decode_with_logprob(
    transformer: &CausalTransformer,
    adapter: &LoraAdapter,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    options: &GenerationOptions,
    train: bool,
) -> Result<Decoded> {
    options.validate()?;
    let (batch, prompt_len) = input_ids.size2()?;
    let device = input_ids.device();
    let eos_id = transformer.config().eos_token_id;
    let max_positions = transformer.config().max_position_embeddings;
    let budget = (options.max_new_tokens as i64).min(max_positions - prompt_len + 1).max(0);

    if let Some(seed) = options.seed {
        crate::utils::set_seed(seed);
    }

    let mut sequences = input_ids.shallow_clone();
    let mut mask = attention_mask.shallow_clone();
    let mut alive = Tensor::f_ones([batch], (Kind::Bool, device))?;
    let mut totals = Tensor::f_zeros([batch], (Kind::Float, device))?;
    let mut emitted: Vec<Tensor> = Vec::new();

    for _ in 0..budget {
        let logits = transformer
            .forward(&sequences, &mask, adapter, train)?
            .f_select(1, -1)?;
        let scores = process_scores(&logits, options)?;

        let chosen = choose(&scores, options.do_sample)?;
        let next = chosen.f_where_self(&alive, &chosen.f_full_like(eos_id)?)?;

        let step_logprob = scores
            .f_log_softmax(-1, Kind::Float)?
            .f_gather(-1, &next.f_unsqueeze(-1)?, false)?
            .f_squeeze_dim(-1)?
            .f_masked_fill(&alive.f_logical_not()?, 0.0)?;
        totals = totals.f_add(&step_logprob)?;

        alive = alive.f_logical_and(&next.f_ne(eos_id)?)?;
        sequences = Tensor::f_cat(&[&sequences, &next.f_unsqueeze(1)?], 1)?;
        mask = Tensor::f_cat(
            &[&mask, &Tensor::f_ones([batch, 1], (Kind::Int64, device))?],
            1,
        )?;
        emitted.push(next);

        if alive.f_any()?.f_to_kind(Kind::Int64)?.f_int64_value(&[])? == 0 {
            break;
        }
    }

    let tokens = if emitted.is_empty() {
        Tensor::f_zeros([batch, 0], (Kind::Int64, device))?
    } else {
        Tensor::f_stack(&emitted, 1)?
    };

    tracing::debug!(
        batch,
        prompt_len,
        steps = emitted.len(),
        "Decoded batch"
    );

    Ok(Decoded {
        tokens,
        logprobs: totals,
    })
}

/// Token ids of one row up to, not including, its first EOS.
pub(crate) fn response_ids(tokens: &Tensor, row: i64, eos_id: i64) -> Result<Vec<u32>> {
    let row = tokens.f_select(0, row)?.f_to_device(tch::Device::Cpu)?;
    let ids = Vec::<i64>::try_from(&row)?;
    Ok(ids
        .into_iter()
        .take_while(|&id| id != eos_id)
        .map(|id| id as u32)
        .collect())
}
