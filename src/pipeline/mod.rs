//! Text-to-image pipeline: loading, conditioning, and rendering
//!
//! A pipeline is loaded once and then rendered against many times. Loading
//! classifies the model family, pulls the diffusers-layout artifacts, swaps
//! the scheduler for DPM-Solver multistep, and fuses an optional LoRA
//! adapter into the text encoder weights.

pub mod conditioning;
pub mod engine;
pub mod family;
pub mod loader;
pub mod lora;
pub mod scheduler;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use conditioning::{Conditioning, TextEncoder, PROMPT_TOKEN_WINDOW};
pub use engine::{CandleBackend, RenderBackend, RenderRequest};
pub use family::PipelineFamily;
pub use loader::{LoadOutcome, LoadedPipeline, PipelineLoader};
pub use lora::{FuseOutcome, DEFAULT_FUSE_SCALE};
pub use scheduler::{SolverConfig, SolverSchedule};

use crate::config::{GenerationDefaults, GenerationLimits};
use crate::error::{Error, Result};

/// Images must land on the latent grid
const SIZE_MULTIPLE: usize = 8;

/// One generation job as submitted from the page, the API, or the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Positive prompt
    pub prompt: String,
    /// Negative prompt, passed through as raw text
    pub negative_prompt: String,
    /// Output width in pixels
    pub width: usize,
    /// Output height in pixels
    pub height: usize,
    /// Denoising steps
    pub steps: usize,
    /// Classifier-free guidance scale
    pub guidance_scale: f64,
    /// Encoder depth to skip when conditioning
    pub clip_skip: usize,
    /// Images per batch
    pub num_images: usize,
    /// Base seed; images in a batch use consecutive seeds. Random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    /// Request pre-filled from the configured defaults.
    pub fn from_defaults(defaults: &GenerationDefaults) -> Self {
        Self {
            prompt: defaults.prompt.clone(),
            negative_prompt: defaults.negative_prompt.clone(),
            width: defaults.width,
            height: defaults.height,
            steps: defaults.steps,
            guidance_scale: defaults.guidance_scale,
            clip_skip: defaults.clip_skip,
            num_images: defaults.num_images,
            seed: None,
        }
    }

    /// Check the request against the configured limits.
    pub fn validate(&self, limits: &GenerationLimits) -> Result<()> {
        for (label, value) in [("width", self.width), ("height", self.height)] {
            if value < limits.min_size || value > limits.max_size {
                return Err(Error::invalid_input(format!(
                    "{} must be between {} and {}, got {}",
                    label, limits.min_size, limits.max_size, value
                )));
            }
            if value % SIZE_MULTIPLE != 0 {
                return Err(Error::invalid_input(format!(
                    "{} must be a multiple of {}, got {}",
                    label, SIZE_MULTIPLE, value
                )));
            }
        }
        if self.steps == 0 || self.steps > limits.max_steps {
            return Err(Error::invalid_input(format!(
                "steps must be between 1 and {}, got {}",
                limits.max_steps, self.steps
            )));
        }
        if self.guidance_scale < limits.min_guidance || self.guidance_scale > limits.max_guidance {
            return Err(Error::invalid_input(format!(
                "guidance scale must be between {} and {}, got {}",
                limits.min_guidance, limits.max_guidance, self.guidance_scale
            )));
        }
        if self.clip_skip == 0 || self.clip_skip > limits.max_clip_skip {
            return Err(Error::invalid_input(format!(
                "clip skip must be between 1 and {}, got {}",
                limits.max_clip_skip, self.clip_skip
            )));
        }
        if self.num_images == 0 || self.num_images > limits.max_images {
            return Err(Error::invalid_input(format!(
                "image count must be between 1 and {}, got {}",
                limits.max_images, self.num_images
            )));
        }
        Ok(())
    }
}

/// Where a finished batch landed on disk, in render order.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedImageSet {
    /// Saved image paths
    pub paths: Vec<PathBuf>,
}
