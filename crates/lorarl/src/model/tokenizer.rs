//! Chat prompt rendering and batch tokenization.

use crate::session::{ChatHistory, Role};
use crate::{LoraRlError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use tch::{Device, Tensor};
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer};

/// Names used for each role when rendering prompts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDict {
    pub user: String,
    pub agent: String,
    pub system: String,
}

impl Default for RoleDict {
    fn default() -> Self {
        Self {
            user: "user".to_string(),
            agent: "assistant".to_string(),
            system: "system".to_string(),
        }
    }
}

impl RoleDict {
    pub fn name(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user,
            Role::Agent => &self.agent,
        }
    }
}

/// Tokenizer bound to a role dictionary.
pub struct ChatTokenizer {
    tokenizer: Tokenizer,
    role_dict: RoleDict,
}

impl ChatTokenizer {
    pub fn new(tokenizer: Tokenizer, role_dict: RoleDict) -> Self {
        Self {
            tokenizer,
            role_dict,
        }
    }

    pub fn role_dict(&self) -> &RoleDict {
        &self.role_dict
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn tokenizer_mut(&mut self) -> &mut Tokenizer {
        &mut self.tokenizer
    }

    /// Render a conversation as `"{role}: {content}\n"` lines ending with the agent cue.
    pub fn render(&self, history: &ChatHistory, system_prompt: &str) -> String {
        let mut prompt = String::new();
        if !system_prompt.is_empty() {
            prompt.push_str(&format!("{}: {}\n", self.role_dict.system, system_prompt));
        }
        for item in history {
            prompt.push_str(&format!(
                "{}: {}\n",
                self.role_dict.name(item.role),
                item.content
            ));
        }
        prompt.push_str(&format!("{}:", self.role_dict.agent));
        prompt
    }

    /// Switch to left padding with `pad_id` until the guard is dropped.
    pub fn left_padding(&mut self, pad_id: u32) -> Result<PaddingGuard<'_>> {
        let pad_token = self.tokenizer.id_to_token(pad_id).ok_or_else(|| {
            LoraRlError::Tokenizer(format!("pad token id {} not in vocabulary", pad_id))
        })?;
        let previous = self.tokenizer.get_padding().cloned();
        self.tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Left,
            pad_to_multiple_of: None,
            pad_id,
            pad_type_id: 0,
            pad_token,
        }));
        Ok(PaddingGuard {
            tokenizer: &mut self.tokenizer,
            previous,
        })
    }
}

/// Restores the tokenizer's previous padding configuration on drop, on every exit path.
pub struct PaddingGuard<'a> {
    tokenizer: &'a mut Tokenizer,
    previous: Option<PaddingParams>,
}

impl PaddingGuard<'_> {
    /// Tokenize prompts into one left-padded batch.
    pub fn encode_batch(&self, prompts: Vec<String>) -> Result<EncodedBatch> {
        let batch_size = prompts.len();
        let encodings = self
            .tokenizer
            .encode_batch(prompts, true)
            .map_err(|e| LoraRlError::Tokenizer(e.to_string()))?;
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }

        Ok(EncodedBatch {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }
}

impl Deref for PaddingGuard<'_> {
    type Target = Tokenizer;

    fn deref(&self) -> &Tokenizer {
        self.tokenizer
    }
}

impl Drop for PaddingGuard<'_> {
    fn drop(&mut self) {
        self.tokenizer.with_padding(self.previous.take());
    }
}

/// Row-major token ids and mask of a padded batch.
#[derive(Clone, Debug)]
pub struct EncodedBatch {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl EncodedBatch {
    /// `(input_ids, attention_mask)` as `[batch, seq]` tensors on `device`.
    pub fn to_tensors(&self, device: Device) -> Result<(Tensor, Tensor)> {
        let shape = [self.batch_size as i64, self.seq_len as i64];
        let ids = Tensor::from_slice(&self.input_ids)
            .f_view(shape)?
            .f_to_device(device)?;
        let mask = Tensor::from_slice(&self.attention_mask)
            .f_view(shape)?
            .f_to_device(device)?;
        Ok((ids, mask))
    }
}
