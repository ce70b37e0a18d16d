//! Command-line interface for the easel binary

pub mod commands;
pub mod error;
pub mod logging;
pub mod progress;

// Re-export command structures
pub use commands::{generate::GenerateCommand, serve::ServeCommand, tags::TagsCommand};

// Re-export error types
pub use error::{CliError, CliResult};
