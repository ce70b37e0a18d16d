//! Danbooru tag completion
//!
//! A templated prompt built from the six tag fields is completed by a
//! pretrained tag model under top-k / top-p sampling, then every token of
//! the finished sequence is decoded on its own and the non-empty pieces are
//! joined with `", "`. The prompt's own tags survive into the output; only
//! special tokens fall away.

pub(crate) mod model;
pub mod template;

pub use template::{AspectRatio, Rating, TagLength, TagPromptRequest};

use candle_core::Device;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use rand::Rng;
use tracing::debug;

use crate::config::TaggerConfig;
use crate::error::Result;
use model::{DartTagModel, TagModel};

/// Completes tag prompts against a loaded tag model.
pub struct TagGenerator {
    model: Box<dyn TagModel>,
    max_new_tokens: usize,
    temperature: f64,
    top_p: f64,
    top_k: usize,
    seed: Option<u64>,
}

impl TagGenerator {
    /// Load the configured tag model and wrap it for generation.
    pub fn load(config: &TaggerConfig, device: &Device) -> Result<Self> {
        let model = DartTagModel::load(&config.model_id, device)?;
        Ok(Self::with_model(Box::new(model), config))
    }

    pub(crate) fn with_model(model: Box<dyn TagModel>, config: &TaggerConfig) -> Self {
        Self {
            model,
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            seed: config.seed,
        }
    }

    /// Complete one tag prompt into a joined tag string.
    pub fn generate(&self, request: &TagPromptRequest) -> Result<String> {
        let prompt = request.render();
        debug!("tag prompt: {}", prompt);

        let mut ids = self.model.encode(&prompt)?;
        let eos = self.model.eos_token_id();
        let seed = match self.seed {
            Some(seed) => seed,
            None => rand::rng().random(),
        };
        let mut sampler = LogitsProcessor::from_sampling(
            seed,
            Sampling::TopKThenTopP {
                k: self.top_k,
                p: self.top_p,
                temperature: self.temperature,
            },
        );

        for _ in 0..self.max_new_tokens {
            let logits = self.model.next_token_logits(&ids)?;
            let next = sampler.sample(&logits)?;
            ids.push(next);
            if next == eos {
                break;
            }
        }
        debug!("tag sequence finished at {} tokens", ids.len());

        let mut pieces = Vec::new();
        for id in &ids {
            let piece = self.model.decode_token(*id)?;
            if !piece.trim().is_empty() {
                pieces.push(piece);
            }
        }
        Ok(pieces.join(", "))
    }
}
