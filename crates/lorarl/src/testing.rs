//! Tiny in-memory models for tests and smoke runs.
//!
//! The fixtures need no files on disk: a word-level tokenizer over a fixed vocabulary and a
//! randomly initialized two-layer transformer that runs on CPU in milliseconds.

use crate::model::{
    AdapterSource, BaseModel, BaseModelConfig, DevicePlacement, LoraConfig, LoraLanguageModel,
    Precision, RoleDict,
};
use crate::{LoraRlError, Result};
use std::str::FromStr;
use tokenizers::Tokenizer;

/// Vocabulary of [`tiny_tokenizer`], indexed by token id.
pub const TINY_VOCAB: [&str; 32] = [
    "<unk>", "</s>", "<pad>", "system", "user", "assistant", ":", "you", "are", "a", "helpful",
    "agent", "hello", "select", "from", "table", "where", "answer", "is", "the", "yes", "no",
    "count", "rows", "?", ".", "1", "2", "3", "ok", "done", "sql",
];

/// Id of `</s>` in [`TINY_VOCAB`].
pub const TINY_EOS_ID: i64 = 1;

/// Whitespace word-level tokenizer over [`TINY_VOCAB`].
pub fn tiny_tokenizer() -> Result<Tokenizer> {
    let vocab: serde_json::Map<String, serde_json::Value> = TINY_VOCAB
        .iter()
        .enumerate()
        .map(|(id, token)| (token.to_string(), serde_json::Value::from(id)))
        .collect();
    let special = |id: usize| {
        serde_json::json!({
            "id": id,
            "content": TINY_VOCAB[id],
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        })
    };

    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0), special(1), special(2)],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });

    Tokenizer::from_str(&json.to_string()).map_err(|e| LoraRlError::Tokenizer(e.to_string()))
}

/// Two layers, hidden size 16, 48 positions.
pub fn tiny_base_config() -> BaseModelConfig {
    BaseModelConfig {
        vocab_size: TINY_VOCAB.len() as i64,
        hidden_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 32,
        max_position_embeddings: 48,
        layer_norm_eps: 1e-5,
        eos_token_id: TINY_EOS_ID,
    }
}

/// Randomly initialized CPU base model, deterministic for a given seed.
pub fn tiny_base_model(seed: i64) -> Result<BaseModel> {
    crate::utils::set_seed(seed);
    BaseModel::from_config(
        tiny_base_config(),
        tiny_tokenizer()?,
        Precision::Float32,
        DevicePlacement::Cpu,
    )
}

/// [`tiny_base_model`] with a fresh adapter.
pub fn tiny_lora_model(seed: i64, lora: LoraConfig) -> Result<LoraLanguageModel> {
    LoraLanguageModel::new(
        tiny_base_model(seed)?,
        RoleDict::default(),
        AdapterSource::Config(lora),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_tokenizer_roundtrip() {
        let tokenizer = tiny_tokenizer().unwrap();
        assert_eq!(tokenizer.get_vocab_size(true), TINY_VOCAB.len());
        assert_eq!(tokenizer.token_to_id("</s>"), Some(TINY_EOS_ID as u32));

        let encoding = tokenizer.encode("user: count the rows ?", false).unwrap();
        assert_eq!(encoding.get_ids(), &[4, 6, 22, 19, 23, 24]);
        assert_eq!(
            tokenizer.decode(&[12, 1, 29], true).unwrap(),
            "hello ok"
        );
    }
}
