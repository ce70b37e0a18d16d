//! Session facade
//!
//! One `Studio` owns everything a browser session touches: the loaded
//! pipeline, the cached tag generator, and the action-enablement state the
//! page mirrors. The server wraps it in an async mutex so actions run one
//! at a time, which is the execution model the page was built around.

use candle_core::{DType, Device};
use rand::Rng;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::pipeline::{
    CandleBackend, FuseOutcome, GeneratedImageSet, GenerationRequest, LoadedPipeline,
    PipelineFamily, PipelineLoader, RenderBackend, RenderRequest,
};
use crate::tagger::{TagGenerator, TagPromptRequest};

/// Action enablement mirrored by the page's buttons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UiState {
    /// Generate button usable
    pub can_generate: bool,
    /// Generate-from-tags button usable
    pub can_generate_from_tags: bool,
    /// Copy button usable
    pub can_copy: bool,
}

/// What a model load hands back to the page.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    /// Echoed model id
    pub model_id: String,
    /// Adapter id, echoed only when fusion succeeded
    pub adapter_id: Option<String>,
    /// Classified family
    pub family: PipelineFamily,
    /// Fusion outcome when an adapter was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuse: Option<FuseOutcome>,
    /// Toast messages, in display order
    pub notices: Vec<String>,
    /// Enablement after the load
    pub ui: UiState,
}

/// What tag completion hands back to the page.
#[derive(Debug, Clone, Serialize)]
pub struct TagReport {
    /// Joined tag string
    pub tags: String,
    /// Enablement after the completion
    pub ui: UiState,
}

/// Owns the pipeline, the tagger, and the session's UI state.
pub struct Studio {
    config: AppConfig,
    device: Device,
    dtype: DType,
    backend: Box<dyn RenderBackend>,
    pipeline: Option<LoadedPipeline>,
    tagger: Option<TagGenerator>,
    last_tags: String,
    ui: UiState,
}

impl Studio {
    /// Studio on the best available device, rendering through candle.
    pub fn new(config: AppConfig) -> Result<Self> {
        let (device, dtype) = crate::device::select()?;
        Ok(Self::with_backend(
            config,
            device,
            dtype,
            Box::new(CandleBackend),
        ))
    }

    /// Studio with an explicit device and render backend.
    pub fn with_backend(
        config: AppConfig,
        device: Device,
        dtype: DType,
        backend: Box<dyn RenderBackend>,
    ) -> Self {
        Self {
            config,
            device,
            dtype,
            backend,
            pipeline: None,
            tagger: None,
            last_tags: String::new(),
            ui: UiState::default(),
        }
    }

    /// The configuration this session runs with
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Current action enablement
    pub fn ui(&self) -> UiState {
        self.ui
    }

    /// Last completed tag string, empty before the first completion
    pub fn last_tags(&self) -> &str {
        &self.last_tags
    }

    /// The loaded pipeline, if any
    pub fn pipeline(&self) -> Option<&LoadedPipeline> {
        self.pipeline.as_ref()
    }

    /// Load a pipeline, replacing whatever was loaded before.
    ///
    /// Adapter trouble downgrades to advisory notices and a pipeline without
    /// the adapter. Base model trouble is fatal and leaves the previously
    /// loaded pipeline in place.
    #[instrument(skip(self))]
    pub fn load_model(&mut self, model_id: &str, adapter_id: Option<&str>) -> Result<LoadReport> {
        let adapter_id = adapter_id.map(str::trim).filter(|s| !s.is_empty());
        let loader = PipelineLoader::new(self.device.clone(), self.dtype);
        let outcome = loader.load(model_id, adapter_id)?;

        let mut notices = Vec::new();
        match (&outcome.fuse, adapter_id) {
            (Some(FuseOutcome::Fused { layers, .. }), Some(adapter)) => {
                info!("adapter fused into {} layer(s)", layers);
                notices.push(format!("Loaded LoRA {}", adapter));
                notices.push(format!("Loaded {} with {}", model_id, adapter));
            }
            (Some(FuseOutcome::Incompatible { reason }), Some(adapter)) => {
                warn!("adapter rejected: {}", reason);
                notices.push(format!(
                    "LoRA {} is not compatible with model {}",
                    adapter, model_id
                ));
                notices.push("Use a matching LoRA; an SDXL model needs an XL LoRA".to_string());
                notices.push("Model loaded without LoRA".to_string());
            }
            _ => notices.push(format!("Loaded {}", model_id)),
        }

        self.ui.can_generate = true;
        self.ui.can_generate_from_tags = !self.last_tags.is_empty();

        let report = LoadReport {
            model_id: outcome.pipeline.model_id.clone(),
            adapter_id: outcome.pipeline.adapter_id.clone(),
            family: outcome.pipeline.family,
            fuse: outcome.fuse,
            notices,
            ui: self.ui,
        };
        self.pipeline = Some(outcome.pipeline);
        Ok(report)
    }

    /// Render a batch of images into the output directory.
    ///
    /// Filenames restart at `output_image_1.png` per batch; earlier runs
    /// are overwritten.
    #[instrument(skip(self, request), fields(images = request.num_images))]
    pub fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImageSet> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| Error::invalid_input("no model loaded; load a model before generating"))?;
        request.validate(&self.config.generation.limits)?;

        let output_dir = &self.config.storage.output_dir;
        std::fs::create_dir_all(output_dir)?;

        let mut paths = Vec::with_capacity(request.num_images);
        for index in 0..request.num_images {
            let seed = match request.seed {
                Some(base) => base.wrapping_add(index as u64),
                None => rand::rng().random(),
            };
            // Conditioning is rebuilt for every image of the batch.
            let positive = pipeline.conditioning(&request.prompt, request.clip_skip)?;
            let negative = pipeline.conditioning(&request.negative_prompt, request.clip_skip)?;
            let render = RenderRequest {
                width: request.width,
                height: request.height,
                steps: request.steps,
                guidance_scale: request.guidance_scale,
                seed,
            };
            let image = self.backend.render(pipeline, &positive, &negative, &render)?;

            let path = output_dir.join(format!("output_image_{}.png", paths.len() + 1));
            image.save(&path)?;
            info!("saved {}", path.display());
            paths.push(path);
        }
        Ok(GeneratedImageSet { paths })
    }

    /// Complete a tag prompt. The tag model is loaded on first use and
    /// cached for the rest of the session.
    #[instrument(skip(self, request))]
    pub fn generate_tags(&mut self, request: &TagPromptRequest) -> Result<TagReport> {
        let tagger = match self.tagger.take() {
            Some(tagger) => tagger,
            None => TagGenerator::load(&self.config.tagger, &self.device)?,
        };
        let result = tagger.generate(request);
        self.tagger = Some(tagger);
        let tags = result?;

        self.last_tags = tags.clone();
        self.ui.can_copy = true;
        self.ui.can_generate_from_tags = self.pipeline.is_some();
        Ok(TagReport { tags, ui: self.ui })
    }

    #[cfg(test)]
    pub(crate) fn install_tagger(&mut self, tagger: TagGenerator) {
        self.tagger = Some(tagger);
    }
}
