//! Pipeline construction
//!
//! Loading classifies the model id, resolves artifacts from a diffusers
//! layout, materializes the text encoder weights at the selected precision,
//! swaps whatever scheduler the repository configured for DPM-Solver
//! multistep, and optionally fuses a LoRA adapter. Adapter problems are
//! advisory; base model problems are fatal.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::hub::{ModelSource, WeightSource, FALLBACK_CLIP_TOKENIZER};
use crate::pipeline::conditioning::{self, Conditioning, TextEncoder};
use crate::pipeline::family::PipelineFamily;
use crate::pipeline::lora::{self, FuseOutcome, DEFAULT_FUSE_SCALE};
use crate::pipeline::scheduler::SolverConfig;

/// Tokenizer and text-encoder subdirectories per encoder slot
const ENCODER_SUBDIRS: [(&str, &str); 2] = [
    ("tokenizer", "text_encoder"),
    ("tokenizer_2", "text_encoder_2"),
];

/// Weight shard names tried per text encoder, reduced precision first
const WEIGHT_CANDIDATES: [&str; 2] = ["model.fp16.safetensors", "model.safetensors"];

/// Weight file names tried inside an adapter repository
const ADAPTER_CANDIDATES: [&str; 3] = [
    "pytorch_lora_weights.safetensors",
    "lora.safetensors",
    "model.safetensors",
];

/// A ready-to-render pipeline.
///
/// Replaced wholesale on every load; the only mutation it ever sees is
/// adapter fusion during construction.
pub struct LoadedPipeline {
    /// Model id as given by the user
    pub model_id: String,
    /// Fused adapter id; `None` when no adapter was requested or fusion
    /// was incompatible
    pub adapter_id: Option<String>,
    /// Classified family
    pub family: PipelineFamily,
    /// Swapped-in solver configuration
    pub scheduler: SolverConfig,
    /// Device the weights live on
    pub device: Device,
    /// Weight precision
    pub dtype: DType,
    pub(crate) encoders: Vec<TextEncoder>,
    pub(crate) weights: Vec<HashMap<String, Tensor>>,
}

impl LoadedPipeline {
    /// Build conditioning for a prompt with this pipeline's encoders.
    pub fn conditioning(&self, text: &str, clip_skip: usize) -> Result<Conditioning> {
        conditioning::build(&self.encoders, self.family, text, clip_skip)
    }

    /// Number of text encoders held
    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }

    /// Post-fusion weight map of one text encoder
    pub fn encoder_weights(&self, index: usize) -> Option<&HashMap<String, Tensor>> {
        self.weights.get(index)
    }
}

/// What a load produced
pub struct LoadOutcome {
    /// The new pipeline
    pub pipeline: LoadedPipeline,
    /// Fusion outcome; `None` when no adapter was requested
    pub fuse: Option<FuseOutcome>,
}

/// Builds pipelines on a fixed device and precision.
pub struct PipelineLoader {
    device: Device,
    dtype: DType,
}

impl PipelineLoader {
    /// Loader for the given device and weight precision.
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// Load a pipeline, optionally fusing an adapter.
    #[instrument(skip(self))]
    pub fn load(&self, model_id: &str, adapter_id: Option<&str>) -> Result<LoadOutcome> {
        let source = ModelSource::parse(model_id);
        let family = PipelineFamily::classify(&family_key(&source));
        info!("loading {} as a {} family pipeline", model_id, family);

        let scheduler = match source.try_get("scheduler/scheduler_config.json") {
            Some(path) => SolverConfig::from_file(&path)?,
            None => {
                debug!("no scheduler config shipped, using training defaults");
                SolverConfig::default()
            }
        };

        let mut tokenizers = Vec::new();
        let mut weights = Vec::new();
        for slot in 0..family.encoder_count() {
            let (tokenizer_dir, encoder_dir) = ENCODER_SUBDIRS[slot];
            tokenizers.push(self.load_tokenizer(&source, tokenizer_dir)?);
            weights.push(self.load_encoder_weights(&source, encoder_dir)?);
        }

        let fuse = adapter_id.map(|adapter| self.fuse_adapter(&mut weights, adapter));

        let encoders = tokenizers
            .into_iter()
            .zip(weights.iter())
            .map(|(tokenizer, map)| TextEncoder::from_weights(tokenizer, map))
            .collect::<Result<Vec<_>>>()?;

        let fused = matches!(fuse, Some(FuseOutcome::Fused { .. }));
        let pipeline = LoadedPipeline {
            model_id: model_id.to_string(),
            adapter_id: if fused {
                adapter_id.map(str::to_string)
            } else {
                None
            },
            family,
            scheduler,
            device: self.device.clone(),
            dtype: self.dtype,
            encoders,
            weights,
        };
        info!(
            "pipeline ready: {} encoder(s) on {:?} at {:?}",
            pipeline.encoder_count(),
            pipeline.device,
            pipeline.dtype
        );
        Ok(LoadOutcome { pipeline, fuse })
    }

    fn load_tokenizer(&self, source: &ModelSource, subdir: &str) -> Result<Tokenizer> {
        let path = match source.try_get(&format!("{}/tokenizer.json", subdir)) {
            Some(path) => path,
            None => {
                debug!(
                    "{} ships no {}/tokenizer.json, falling back to {}",
                    source.id(),
                    subdir,
                    FALLBACK_CLIP_TOKENIZER
                );
                ModelSource::Hub(FALLBACK_CLIP_TOKENIZER.to_string()).get("tokenizer.json")?
            }
        };
        Tokenizer::from_file(&path).map_err(|e| {
            Error::tokenizer(format!(
                "failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn load_encoder_weights(
        &self,
        source: &ModelSource,
        subdir: &str,
    ) -> Result<HashMap<String, Tensor>> {
        let candidates: Vec<String> = WEIGHT_CANDIDATES
            .iter()
            .map(|name| format!("{}/{}", subdir, name))
            .collect();
        let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
        let path = source.get_first(&refs)?;

        let raw = WeightSource::open(&path)?.load_all(&self.device)?;
        let mut converted = HashMap::with_capacity(raw.len());
        for (name, tensor) in raw {
            let tensor = if is_float(tensor.dtype()) {
                tensor.to_dtype(self.dtype)?
            } else {
                tensor
            };
            converted.insert(name, tensor);
        }
        Ok(converted)
    }

    /// Resolve and fuse an adapter. Every failure collapses into an
    /// `Incompatible` outcome so loading continues.
    fn fuse_adapter(
        &self,
        weights: &mut [HashMap<String, Tensor>],
        adapter_id: &str,
    ) -> FuseOutcome {
        info!(
            "fusing adapter {} at strength {}",
            adapter_id, DEFAULT_FUSE_SCALE
        );
        let loaded = (|| -> Result<HashMap<String, Tensor>> {
            let source = ModelSource::parse(adapter_id);
            let path = source.get_first(&ADAPTER_CANDIDATES)?;
            WeightSource::open(&path)?.load_all(&self.device)
        })();
        match loaded {
            Ok(adapter) => lora::apply_adapter(weights, &adapter, DEFAULT_FUSE_SCALE),
            Err(e) => {
                warn!("adapter {} unavailable: {}", adapter_id, e);
                FuseOutcome::Incompatible {
                    reason: e.to_string(),
                }
            }
        }
    }
}

fn is_float(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
}

/// The string the family heuristic runs on. Local checkpoints classify by
/// their directory name; the surrounding path must not feed the substring
/// check.
fn family_key(source: &ModelSource) -> String {
    match source {
        ModelSource::Local(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| source.id()),
        ModelSource::Hub(id) => id.clone(),
    }
}
