//! One-shot tag-prompt completion without the server

use std::path::PathBuf;

use clap::Args;

use crate::cli::error::CliResult;
use crate::cli::logging;
use crate::cli::progress::ProgressReporter;
use crate::clipboard;
use crate::config::AppConfig;
use crate::device;
use crate::tagger::{AspectRatio, Rating, TagGenerator, TagLength, TagPromptRequest};

/// Arguments for `easel tags`
#[derive(Args, Debug)]
pub struct TagsCommand {
    /// Configuration file (YAML or JSON)
    #[arg(long, env = "EASEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Copyright (franchise) tags to condition on
    #[arg(long)]
    pub copyright: Option<String>,

    /// Character tags to condition on
    #[arg(long)]
    pub character: Option<String>,

    /// General tags to expand
    #[arg(short, long)]
    pub general: Option<String>,

    /// Content rating band (sfw, general, sensitive)
    #[arg(short, long)]
    pub rating: Option<Rating>,

    /// Aspect-ratio band (ultra_wide, wide, square, tall, ultra_tall)
    #[arg(short, long)]
    pub aspect_ratio: Option<AspectRatio>,

    /// Output length band (very_short, short, medium, long, very_long)
    #[arg(short, long)]
    pub length: Option<TagLength>,

    /// Sampling seed for reproducible tag lists
    #[arg(short, long)]
    pub seed: Option<u64>,
}

/// Complete a tag prompt and print the joined tag list to stdout.
pub async fn execute(cmd: TagsCommand) -> CliResult<()> {
    let mut config = match &cmd.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    if cmd.seed.is_some() {
        config.tagger.seed = cmd.seed;
    }
    config.validate()?;

    let mut request = TagPromptRequest::from_defaults(&config.tagger.defaults);
    if let Some(copyright) = cmd.copyright {
        request.copyright = copyright;
    }
    if let Some(character) = cmd.character {
        request.character = character;
    }
    if let Some(general) = cmd.general {
        request.general = general;
    }
    if let Some(rating) = cmd.rating {
        request.rating = rating;
    }
    if let Some(ratio) = cmd.aspect_ratio {
        request.aspect_ratio = ratio;
    }
    if let Some(length) = cmd.length {
        request.length = length;
    }

    let (device, _) = device::select()?;

    let progress = ProgressReporter::new(&format!("Loading {}", config.tagger.model_id))?;
    let generator = TagGenerator::load(&config.tagger, &device)?;
    progress.set_message("Sampling tags...");
    let tags = generator.generate(&request)?;
    progress.finish_and_clear();

    match printable_tags(&tags) {
        Some(line) => println!("{}", line),
        None => logging::warning("Tag model produced no usable tags"),
    }
    Ok(())
}

/// The stdout line for a finished completion; blank results print nothing.
fn printable_tags(tags: &str) -> Option<&str> {
    clipboard::copy_payload(tags)
}
