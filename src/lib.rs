//! easel - Self-hosted Stable Diffusion studio
//!
//! This crate serves a single-page image-generation studio on top of SD 1.x
//! and SDXL checkpoints: model and LoRA loading with weight fusion, a
//! Danbooru-style tag prompt generator, and PNG output, driven from a web
//! page or the command line.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod pipeline;
pub mod studio;
pub mod tagger;

// Re-exports
pub use config::AppConfig;
pub use error::{Error, Result};
pub use pipeline::{GeneratedImageSet, GenerationRequest};
pub use studio::{LoadReport, Studio, TagReport, UiState};
