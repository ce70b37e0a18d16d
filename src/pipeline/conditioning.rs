//! Prompt conditioning
//!
//! Prompts are tokenized into the fixed 77-token CLIP window and embedded
//! with the checkpoint's own token and position tables. The large family
//! concatenates the hidden states of both encoders along the feature axis
//! and keeps the second encoder's pooled vector; the base family uses a
//! single encoder and no pooled output.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use candle_nn::{Embedding, Module};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::pipeline::family::PipelineFamily;

/// CLIP conditioning window, in tokens
pub const PROMPT_TOKEN_WINDOW: usize = 77;

const TOKEN_EMBEDDING_KEYS: &[&str] = &[
    "text_model.embeddings.token_embedding.weight",
    "embeddings.token_embedding.weight",
    "token_embedding.weight",
];

const POSITION_EMBEDDING_KEYS: &[&str] = &[
    "text_model.embeddings.position_embedding.weight",
    "embeddings.position_embedding.weight",
    "position_embedding.weight",
];

/// One text encoder: a tokenizer plus the checkpoint's embedding tables.
pub struct TextEncoder {
    tokenizer: Tokenizer,
    token_embedding: Embedding,
    position_embedding: Option<Tensor>,
    hidden_size: usize,
    pad_token_id: u32,
    device: Device,
}

/// Hidden states and pooled vector produced by one encoder
pub struct EncoderOutput {
    /// Per-token states, `(1, 77, hidden)`
    pub hidden: Tensor,
    /// State at the final prompt token, `(1, hidden)`
    pub pooled: Tensor,
}

impl TextEncoder {
    /// Build an encoder from a tokenizer and a loaded weight map.
    pub(crate) fn from_weights(
        tokenizer: Tokenizer,
        weights: &HashMap<String, Tensor>,
    ) -> Result<Self> {
        let table = find(weights, TOKEN_EMBEDDING_KEYS).ok_or_else(|| {
            Error::model_loading("no token embedding table in text encoder weights")
        })?;
        let dims = table.dims();
        if dims.len() != 2 {
            return Err(Error::model_loading(format!(
                "token embedding table has unexpected shape {:?}",
                dims
            )));
        }
        let hidden_size = dims[1];
        let device = table.device().clone();
        let position_embedding = find(weights, POSITION_EMBEDDING_KEYS).cloned();
        let pad_token_id = tokenizer
            .token_to_id("<|endoftext|>")
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .unwrap_or(0);

        Ok(Self {
            tokenizer,
            token_embedding: Embedding::new(table.clone(), hidden_size),
            position_embedding,
            hidden_size,
            pad_token_id,
            device,
        })
    }

    /// Feature width of this encoder's states
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Tokenize into the fixed window. Longer prompts are truncated, shorter
    /// ones padded; the returned index is the last real token's position.
    fn token_window(&self, text: &str) -> Result<(Vec<u32>, usize)> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::tokenizer(format!("failed to encode prompt: {}", e)))?;
        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        ids.truncate(PROMPT_TOKEN_WINDOW);
        if ids.is_empty() {
            ids.push(self.pad_token_id);
        }
        let last = ids.len() - 1;
        ids.resize(PROMPT_TOKEN_WINDOW, self.pad_token_id);
        Ok((ids, last))
    }

    /// Embed a prompt into per-token states plus the pooled vector.
    pub fn encode(&self, text: &str) -> Result<EncoderOutput> {
        let (ids, last) = self.token_window(text)?;
        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let mut hidden = self.token_embedding.forward(&input)?;
        if let Some(positions) = &self.position_embedding {
            if positions.dims()[0] >= PROMPT_TOKEN_WINDOW {
                let window = positions
                    .narrow(0, 0, PROMPT_TOKEN_WINDOW)?
                    .to_dtype(hidden.dtype())?
                    .unsqueeze(0)?;
                hidden = hidden.broadcast_add(&window)?;
            }
        }
        let pooled = hidden.narrow(1, last, 1)?.squeeze(1)?;
        Ok(EncoderOutput { hidden, pooled })
    }
}

/// Prompt conditioning handed to the render backend.
pub struct Conditioning {
    /// Token states, `(1, 77, hidden)`; the large family concatenates both
    /// encoders along the feature axis
    pub embeddings: Tensor,
    /// Second encoder's pooled vector, large family only
    pub pooled: Option<Tensor>,
    /// Encoder depth to skip, carried alongside the embeddings
    pub clip_skip: usize,
}

/// Build conditioning for one prompt, dispatching on the pipeline family.
pub(crate) fn build(
    encoders: &[TextEncoder],
    family: PipelineFamily,
    text: &str,
    clip_skip: usize,
) -> Result<Conditioning> {
    match family {
        PipelineFamily::Base => {
            let encoder = encoders
                .first()
                .ok_or_else(|| Error::model_loading("pipeline has no text encoder"))?;
            let output = encoder.encode(text)?;
            Ok(Conditioning {
                embeddings: output.hidden,
                pooled: None,
                clip_skip,
            })
        }
        PipelineFamily::Large => {
            if encoders.len() < 2 {
                return Err(Error::model_loading(
                    "large pipeline requires two text encoders",
                ));
            }
            let first = encoders[0].encode(text)?;
            let second = encoders[1].encode(text)?;
            let embeddings = Tensor::cat(&[&first.hidden, &second.hidden], 2)?;
            Ok(Conditioning {
                embeddings,
                pooled: Some(second.pooled),
                clip_skip,
            })
        }
    }
}

fn find<'a>(weights: &'a HashMap<String, Tensor>, keys: &[&str]) -> Option<&'a Tensor> {
    keys.iter().find_map(|key| weights.get(*key))
}
