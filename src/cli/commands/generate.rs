//! One-shot image generation without the server

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::cli::error::CliResult;
use crate::cli::logging;
use crate::cli::progress::ProgressReporter;
use crate::config::{AppConfig, GenerationDefaults};
use crate::pipeline::GenerationRequest;
use crate::studio::Studio;

/// Arguments for `easel generate`
#[derive(Args, Debug)]
pub struct GenerateCommand {
    /// Configuration file (YAML or JSON)
    #[arg(long, env = "EASEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Model repository id or local directory
    #[arg(short, long)]
    pub model: Option<String>,

    /// LoRA adapter repository id or local directory
    #[arg(short, long)]
    pub adapter: Option<String>,

    /// Skip the configured default adapter
    #[arg(long, conflicts_with = "adapter")]
    pub no_adapter: bool,

    /// Prompt describing the image
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Things the image should not contain
    #[arg(short, long)]
    pub negative_prompt: Option<String>,

    /// Image width in pixels
    #[arg(long)]
    pub width: Option<usize>,

    /// Image height in pixels
    #[arg(long)]
    pub height: Option<usize>,

    /// Denoising step count
    #[arg(long)]
    pub steps: Option<usize>,

    /// Guidance scale
    #[arg(long)]
    pub guidance: Option<f64>,

    /// Clip-skip depth
    #[arg(long)]
    pub clip_skip: Option<usize>,

    /// Number of images to generate
    #[arg(short, long)]
    pub count: Option<usize>,

    /// Sampling seed; consecutive images use consecutive seeds
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Directory for the finished images
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Load a model, render a batch, and print where the images landed.
pub async fn execute(cmd: GenerateCommand) -> CliResult<()> {
    let mut config = match &cmd.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    if let Some(output) = &cmd.output {
        config.storage.output_dir = output.clone();
    }
    config.validate()?;

    let defaults = config.generation.defaults.clone();
    let model = cmd
        .model
        .clone()
        .unwrap_or_else(|| defaults.model_id.clone());
    let adapter = resolve_adapter(&cmd, &defaults);
    let request = build_request(&cmd, &defaults);

    let mut studio = Studio::new(config)?;

    let progress = ProgressReporter::new(&format!("Loading {}", model))?;
    let report = studio.load_model(&model, adapter.as_deref())?;
    progress.finish_and_clear();
    for notice in &report.notices {
        logging::info(notice);
    }

    let progress = ProgressReporter::new(&format!(
        "Generating {} image(s) at {}x{}",
        request.num_images, request.width, request.height
    ))?;
    let set = studio.generate(&request)?;
    progress.finish_and_clear();

    info!(count = set.paths.len(), "generation finished");
    for path in &set.paths {
        logging::success(&format!("Saved {}", path.display()));
    }
    Ok(())
}

fn resolve_adapter(cmd: &GenerateCommand, defaults: &GenerationDefaults) -> Option<String> {
    if cmd.no_adapter {
        return None;
    }
    cmd.adapter.clone().or_else(|| defaults.adapter_id.clone())
}

fn build_request(cmd: &GenerateCommand, defaults: &GenerationDefaults) -> GenerationRequest {
    let mut request = GenerationRequest::from_defaults(defaults);
    if let Some(prompt) = &cmd.prompt {
        request.prompt = prompt.clone();
    }
    if let Some(negative) = &cmd.negative_prompt {
        request.negative_prompt = negative.clone();
    }
    if let Some(width) = cmd.width {
        request.width = width;
    }
    if let Some(height) = cmd.height {
        request.height = height;
    }
    if let Some(steps) = cmd.steps {
        request.steps = steps;
    }
    if let Some(guidance) = cmd.guidance {
        request.guidance_scale = guidance;
    }
    if let Some(clip_skip) = cmd.clip_skip {
        request.clip_skip = clip_skip;
    }
    if let Some(count) = cmd.count {
        request.num_images = count;
    }
    request.seed = cmd.seed;
    request
}
