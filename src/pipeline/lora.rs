//! LoRA adapter parsing and fusion
//!
//! Adapters are fused into the base weights at load time:
//! `W' = W + scale * (alpha / rank) * (B @ A)`. Both the peft
//! (`lora_A`/`lora_B`) and kohya (`lora_down`/`lora_up`) naming conventions
//! are recognized, with optional `.alpha` side tensors.
//!
//! Fusion is all-or-nothing: either every matched layer is committed, or the
//! base weights stay untouched and the outcome reports why.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use tracing::{debug, warn};

use crate::error::Result;

/// Fixed fusion strength applied to every adapter
pub const DEFAULT_FUSE_SCALE: f64 = 0.7;

/// Outcome of an adapter fusion attempt.
///
/// Incompatibility is an advisory, never a load failure: the pipeline
/// continues unmodified.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FuseOutcome {
    /// Adapter merged; `layers` were rewritten, `skipped` pairs targeted
    /// modules outside the held weight set
    Fused {
        /// Number of base tensors rewritten
        layers: usize,
        /// Number of adapter pairs without a held target
        skipped: usize,
    },
    /// Adapter left the pipeline untouched
    Incompatible {
        /// Human-readable cause
        reason: String,
    },
}

impl FuseOutcome {
    /// True when the adapter was merged
    pub fn is_fused(&self) -> bool {
        matches!(self, Self::Fused { .. })
    }
}

/// Which module an adapter pair targets
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetModule {
    /// A module inside text encoder `index`
    Encoder { index: usize, path: String },
    /// A module easel does not hold (UNet blocks, unknown prefixes)
    External,
}

/// One low-rank weight pair from an adapter file
#[derive(Debug)]
pub(crate) struct AdapterPair {
    target: TargetModule,
    name: String,
    down: Tensor,
    up: Tensor,
    alpha: Option<f64>,
}

const DOWN_SUFFIXES: [(&str, &str); 2] = [
    (".lora_A.weight", ".lora_B.weight"),
    (".lora_down.weight", ".lora_up.weight"),
];

/// Extract low-rank pairs from a raw adapter tensor map.
pub(crate) fn parse_adapter(tensors: &HashMap<String, Tensor>) -> Result<Vec<AdapterPair>> {
    let mut pairs = Vec::new();
    for (name, down) in tensors {
        let Some((stem, up_suffix)) = DOWN_SUFFIXES
            .iter()
            .find_map(|(down_sfx, up_sfx)| name.strip_suffix(down_sfx).map(|s| (s, *up_sfx)))
        else {
            continue;
        };
        let Some(up) = tensors.get(&format!("{}{}", stem, up_suffix)) else {
            debug!("adapter tensor {} has no matching up projection", name);
            continue;
        };
        let alpha = match tensors.get(&format!("{}.alpha", stem)) {
            Some(t) => Some(read_scalar(t)?),
            None => None,
        };
        pairs.push(AdapterPair {
            target: classify_stem(stem),
            name: stem.to_string(),
            down: down.clone(),
            up: up.clone(),
            alpha,
        });
    }
    Ok(pairs)
}

/// Fuse parsed pairs into the per-encoder base weight maps.
pub(crate) fn fuse(
    base: &mut [HashMap<String, Tensor>],
    pairs: &[AdapterPair],
    scale: f64,
) -> FuseOutcome {
    if pairs.is_empty() {
        return FuseOutcome::Incompatible {
            reason: "adapter contains no LoRA weight pairs".to_string(),
        };
    }
    let index = TargetIndex::build(base);
    match compute_merged(base, &index, pairs, scale) {
        Ok(merged) => {
            let layers = merged.replacements.len();
            for (encoder, key, tensor) in merged.replacements {
                base[encoder].insert(key, tensor);
            }
            debug!("fused {} layers, skipped {} pairs", layers, merged.skipped);
            FuseOutcome::Fused {
                layers,
                skipped: merged.skipped,
            }
        }
        Err(reason) => {
            warn!("adapter fusion aborted: {}", reason);
            FuseOutcome::Incompatible { reason }
        }
    }
}

/// Parse and fuse in one step. Any failure becomes an `Incompatible`
/// outcome; the base weights are only modified on full success.
pub(crate) fn apply_adapter(
    base: &mut [HashMap<String, Tensor>],
    adapter: &HashMap<String, Tensor>,
    scale: f64,
) -> FuseOutcome {
    match parse_adapter(adapter) {
        Ok(pairs) => fuse(base, &pairs, scale),
        Err(e) => FuseOutcome::Incompatible {
            reason: format!("adapter weights unreadable: {}", e),
        },
    }
}

struct Merged {
    replacements: Vec<(usize, String, Tensor)>,
    skipped: usize,
}

fn compute_merged(
    base: &[HashMap<String, Tensor>],
    index: &TargetIndex,
    pairs: &[AdapterPair],
    scale: f64,
) -> std::result::Result<Merged, String> {
    let mut replacements = Vec::new();
    let mut skipped = 0usize;

    for pair in pairs {
        let TargetModule::Encoder { index: enc, path } = &pair.target else {
            skipped += 1;
            continue;
        };
        let Some(weights) = base.get(*enc) else {
            return Err(format!(
                "{} targets text encoder {}, which this model does not have",
                pair.name,
                enc + 1
            ));
        };
        let Some(key) = index.resolve(*enc, path) else {
            skipped += 1;
            continue;
        };
        let Some(weight) = weights.get(key) else {
            skipped += 1;
            continue;
        };
        if weight.dims().len() != 2 || pair.down.dims().len() != 2 || pair.up.dims().len() != 2 {
            skipped += 1;
            continue;
        }

        let (out_dim, in_dim) = (weight.dims()[0], weight.dims()[1]);
        let (rank, down_in) = (pair.down.dims()[0], pair.down.dims()[1]);
        let (up_out, up_rank) = (pair.up.dims()[0], pair.up.dims()[1]);
        if up_rank != rank {
            return Err(format!(
                "rank mismatch in {}: down is {}x{}, up is {}x{}",
                pair.name, rank, down_in, up_out, up_rank
            ));
        }
        // A truncated export can carry an empty rank axis; the alpha scale
        // below divides by rank.
        if rank == 0 {
            return Err(format!(
                "empty rank in {}: down is {}x{}, up is {}x{}",
                pair.name, rank, down_in, up_out, up_rank
            ));
        }
        if up_out != out_dim || down_in != in_dim {
            return Err(format!(
                "{} is shaped for a different model: base is {}x{}, adapter produces {}x{}",
                pair.name, out_dim, in_dim, up_out, down_in
            ));
        }

        let alpha_scale = pair.alpha.unwrap_or(rank as f64) / rank as f64;
        let merged = (|| -> Result<Tensor> {
            let delta = pair
                .up
                .to_dtype(DType::F32)?
                .matmul(&pair.down.to_dtype(DType::F32)?)?
                .affine(scale * alpha_scale, 0.0)?;
            let merged = weight.to_dtype(DType::F32)?.add(&delta)?;
            Ok(merged.to_dtype(weight.dtype())?)
        })()
        .map_err(|e| format!("merge failed for {}: {}", pair.name, e))?;

        replacements.push((*enc, key.to_string(), merged));
    }

    Ok(Merged {
        replacements,
        skipped,
    })
}

/// Normalized lookup from adapter module paths to held base tensor names.
///
/// kohya flattens module paths with underscores while diffusers uses dots;
/// comparing names with separators stripped sidesteps both spellings.
struct TargetIndex {
    per_encoder: Vec<HashMap<String, String>>,
}

impl TargetIndex {
    fn build(base: &[HashMap<String, Tensor>]) -> Self {
        let per_encoder = base
            .iter()
            .map(|weights| {
                weights
                    .keys()
                    .map(|key| (normalize(key), key.clone()))
                    .collect()
            })
            .collect();
        Self { per_encoder }
    }

    fn resolve(&self, encoder: usize, path: &str) -> Option<&str> {
        let lookup = format!("{}weight", normalize(path));
        self.per_encoder
            .get(encoder)?
            .get(&lookup)
            .map(String::as_str)
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn classify_stem(stem: &str) -> TargetModule {
    let encoder_prefixes: [(&str, usize); 6] = [
        ("lora_te1_", 0),
        ("lora_te2_", 1),
        ("lora_te_", 0),
        ("text_encoder_2.", 1),
        ("text_encoder.", 0),
        ("te.", 0),
    ];
    for (prefix, index) in encoder_prefixes {
        if let Some(path) = stem.strip_prefix(prefix) {
            return TargetModule::Encoder {
                index,
                path: path.to_string(),
            };
        }
    }
    TargetModule::External
}

fn read_scalar(tensor: &Tensor) -> Result<f64> {
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    match values.first() {
        Some(v) => Ok(*v as f64),
        None => Ok(0.0),
    }
}
