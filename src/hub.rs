//! Model artifact resolution and safetensors weight access
//!
//! A model id is either a Hugging Face Hub repository or a local directory
//! laid out the same way. Ids are treated as opaque: nothing is validated
//! until a file is actually requested.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::Api;
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::debug;

use crate::error::{Error, Result};

/// Tokenizer repository used when a pipeline ships no `tokenizer.json`.
/// CLIP checkpoints in diffusers layouts frequently carry only
/// vocab/merges files, which share this tokenizer.
pub const FALLBACK_CLIP_TOKENIZER: &str = "openai/clip-vit-base-patch32";

/// Where a model's files come from
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// Local directory in diffusers layout
    Local(PathBuf),
    /// Hub repository id, resolved through the shared HF cache
    Hub(String),
}

impl ModelSource {
    /// Interpret an id: an existing local directory wins, anything else is
    /// assumed to be a hub repository.
    pub fn parse(id: &str) -> Self {
        let path = Path::new(id);
        if path.is_dir() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub(id.to_string())
        }
    }

    /// The id as given by the user
    pub fn id(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Hub(id) => id.clone(),
        }
    }

    /// Fetch one file, downloading through the hub cache when remote.
    /// `filename` may contain subdirectories (`text_encoder/model.safetensors`).
    pub fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(filename);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(Error::download(format!(
                        "{} not found in {}",
                        filename,
                        dir.display()
                    )))
                }
            }
            Self::Hub(id) => {
                let api = Api::new()
                    .map_err(|e| Error::download(format!("hub api unavailable: {}", e)))?;
                let repo = api.model(id.clone());
                repo.get(filename).map_err(|e| {
                    Error::download(format!("failed to fetch {} from {}: {}", filename, id, e))
                })
            }
        }
    }

    /// Fetch one file, returning `None` instead of an error when it is absent.
    pub fn try_get(&self, filename: &str) -> Option<PathBuf> {
        match self.get(filename) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("optional artifact {} unavailable: {}", filename, e);
                None
            }
        }
    }

    /// Fetch the first available file out of a candidate list.
    pub fn get_first(&self, candidates: &[&str]) -> Result<PathBuf> {
        for candidate in candidates {
            if let Some(path) = self.try_get(candidate) {
                return Ok(path);
            }
        }
        Err(Error::download(format!(
            "none of [{}] found in {}",
            candidates.join(", "),
            self.id()
        )))
    }
}

/// Memory-mapped safetensors file.
///
/// The header is re-parsed per access; tensor data itself is only copied when
/// a tensor is materialized on a device.
pub struct WeightSource {
    path: PathBuf,
    mmap: Mmap,
}

impl WeightSource {
    /// Map a safetensors file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Mapped read-only; weight files are never written while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        let source = Self { path, mmap };
        source.parse()?;
        Ok(source)
    }

    fn parse(&self) -> Result<SafeTensors<'_>> {
        SafeTensors::deserialize(&self.mmap).map_err(|e| {
            Error::model_loading(format!(
                "invalid safetensors file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Tensor names present in the file.
    pub fn names(&self) -> Result<Vec<String>> {
        let tensors = self.parse()?;
        Ok(tensors.names().into_iter().map(|n| n.to_string()).collect())
    }

    /// Materialize a single tensor on `device`, keeping its stored dtype.
    pub fn tensor(&self, name: &str, device: &Device) -> Result<Tensor> {
        let tensors = self.parse()?;
        let view = tensors.tensor(name).map_err(|e| {
            Error::model_loading(format!(
                "tensor {} missing from {}: {}",
                name,
                self.path.display(),
                e
            ))
        })?;
        tensor_from_view(&view, device)
    }

    /// Materialize every tensor in the file on `device`.
    pub fn load_all(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        let tensors = self.parse()?;
        let mut out = HashMap::new();
        for (name, view) in tensors.tensors() {
            out.insert(name.to_string(), tensor_from_view(&view, device)?);
        }
        debug!(
            "loaded {} tensors from {}",
            out.len(),
            self.path.display()
        );
        Ok(out)
    }
}

/// Convert a safetensors view into a candle tensor.
pub(crate) fn tensor_from_view(view: &TensorView<'_>, device: &Device) -> Result<Tensor> {
    let dtype = match view.dtype() {
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F64 => DType::F64,
        safetensors::Dtype::U8 => DType::U8,
        safetensors::Dtype::U32 => DType::U32,
        safetensors::Dtype::I64 => DType::I64,
        other => {
            return Err(Error::model_loading(format!(
                "unsupported tensor dtype {:?}",
                other
            )))
        }
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
    Ok(tensor)
}
