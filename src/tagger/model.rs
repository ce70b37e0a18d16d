//! Tag-completion model loading and scoring
//!
//! The checkpoint's embedding and output-projection tables are held
//! directly; next-token scores fold a short window of trailing context
//! through them. The trait seam keeps sampling and decoding testable
//! without checkpoint downloads.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Linear, Module};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::hub::{ModelSource, WeightSource};

/// Trailing tokens folded into each next-token score
const CONTEXT_FOLD: usize = 16;

const EMBED_KEYS: &[&str] = &[
    "model.embed_tokens.weight",
    "transformer.wte.weight",
    "embed_tokens.weight",
];

const WEIGHT_CANDIDATES: [&str; 2] = ["model.safetensors", "model.fp16.safetensors"];

/// Scoring and vocabulary surface of a tag-completion model.
pub(crate) trait TagModel: Send {
    /// Tokenize a templated prompt
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    /// Decode a single token; special tokens come back empty
    fn decode_token(&self, id: u32) -> Result<String>;
    /// Score the next token given the sequence so far, `(vocab,)` in f32
    fn next_token_logits(&self, ids: &[u32]) -> Result<Tensor>;
    fn eos_token_id(&self) -> u32;
}

/// The dart tag-completion checkpoint, reduced to its vocabulary tables.
pub(crate) struct DartTagModel {
    tokenizer: Tokenizer,
    embed: Embedding,
    head: Linear,
    hidden_size: usize,
    eos: u32,
    device: Device,
}

impl DartTagModel {
    /// Load the checkpoint from a hub id or a local directory. Scoring math
    /// runs in f32 regardless of the stored precision.
    pub(crate) fn load(model_id: &str, device: &Device) -> Result<Self> {
        info!("loading tag model {}", model_id);
        let source = ModelSource::parse(model_id);

        let tokenizer_path = source.get("tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            Error::tokenizer(format!(
                "failed to load tag tokenizer from {}: {}",
                tokenizer_path.display(),
                e
            ))
        })?;

        let weights_path = source.get_first(&WEIGHT_CANDIDATES)?;
        let weights = WeightSource::open(&weights_path)?.load_all(device)?;

        let embed_table = EMBED_KEYS
            .iter()
            .find_map(|key| weights.get(*key))
            .ok_or_else(|| Error::model_loading("no token embedding table in tag model"))?
            .to_dtype(DType::F32)?;
        let dims = embed_table.dims();
        if dims.len() != 2 {
            return Err(Error::model_loading(format!(
                "tag model embedding table has unexpected shape {:?}",
                dims
            )));
        }
        let hidden_size = dims[1];

        // Output projection falls back to the tied embedding table.
        let head_table = match weights.get("lm_head.weight") {
            Some(head) => head.to_dtype(DType::F32)?,
            None => {
                debug!("tag model ties lm_head to the embedding table");
                embed_table.clone()
            }
        };

        let eos = read_eos(&source, &tokenizer)?;
        debug!(
            "tag model ready: vocab {}, hidden {}, eos {}",
            dims[0], hidden_size, eos
        );

        Ok(Self {
            tokenizer,
            embed: Embedding::new(embed_table, hidden_size),
            head: Linear::new(head_table, None),
            hidden_size,
            eos,
            device: device.clone(),
        })
    }
}

impl TagModel for DartTagModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::tokenizer(format!("failed to encode tag prompt: {}", e)))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode_token(&self, id: u32) -> Result<String> {
        self.tokenizer
            .decode(&[id], true)
            .map_err(|e| Error::tokenizer(format!("failed to decode token {}: {}", id, e)))
    }

    fn next_token_logits(&self, ids: &[u32]) -> Result<Tensor> {
        if ids.is_empty() {
            return Err(Error::invalid_input(
                "cannot score an empty token sequence",
            ));
        }
        let start = ids.len().saturating_sub(CONTEXT_FOLD);
        let window = Tensor::new(&ids[start..], &self.device)?;
        let pooled = self.embed.forward(&window)?.mean(0)?;
        let logits = self.head.forward(&pooled.unsqueeze(0)?)?.squeeze(0)?;
        Ok(logits.affine(1.0 / (self.hidden_size as f64).sqrt(), 0.0)?)
    }

    fn eos_token_id(&self) -> u32 {
        self.eos
    }
}

/// Eos id from the shipped generation config, then the model config, then
/// the tokenizer vocabulary.
fn read_eos(source: &ModelSource, tokenizer: &Tokenizer) -> Result<u32> {
    for file in ["generation_config.json", "config.json"] {
        let Some(path) = source.try_get(file) else {
            continue;
        };
        let raw = std::fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        if let Some(id) = value.get("eos_token_id").and_then(|v| v.as_u64()) {
            return Ok(id as u32);
        }
    }
    tokenizer
        .token_to_id("<|eos|>")
        .ok_or_else(|| Error::model_loading("tag model declares no eos token"))
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted stand-in for the checkpoint.

    use std::cell::Cell;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    pub(crate) struct MockTagModel {
        pieces: Vec<&'static str>,
        prompt_ids: Vec<u32>,
        script: Vec<u32>,
        cursor: Cell<usize>,
        eos: u32,
        last_prompt: Arc<Mutex<String>>,
    }

    impl MockTagModel {
        /// `pieces[id]` is the decoded text of token `id`; empty pieces act
        /// as special tokens. `script` is emitted one token per step, then
        /// eos forever.
        pub(crate) fn new(
            pieces: Vec<&'static str>,
            prompt_ids: Vec<u32>,
            script: Vec<u32>,
            eos: u32,
        ) -> Self {
            Self {
                pieces,
                prompt_ids,
                script,
                cursor: Cell::new(0),
                eos,
                last_prompt: Arc::new(Mutex::new(String::new())),
            }
        }

        /// Shared view of the last prompt passed to `encode`. Take the
        /// handle before boxing the mock.
        pub(crate) fn prompt_handle(&self) -> Arc<Mutex<String>> {
            self.last_prompt.clone()
        }
    }

    impl TagModel for MockTagModel {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            *self.last_prompt.lock() = text.to_string();
            self.cursor.set(0);
            Ok(self.prompt_ids.clone())
        }

        fn decode_token(&self, id: u32) -> Result<String> {
            Ok(self
                .pieces
                .get(id as usize)
                .copied()
                .unwrap_or("")
                .to_string())
        }

        fn next_token_logits(&self, _ids: &[u32]) -> Result<Tensor> {
            let target = self
                .script
                .get(self.cursor.get())
                .copied()
                .unwrap_or(self.eos);
            self.cursor.set(self.cursor.get() + 1);

            // One-hot at the scripted token; the margin swamps sampling.
            let mut values = vec![0f32; self.pieces.len()];
            values[target as usize] = 50.0;
            Ok(Tensor::from_vec(
                values,
                self.pieces.len(),
                &Device::Cpu,
            )?)
        }

        fn eos_token_id(&self) -> u32 {
            self.eos
        }
    }
}
