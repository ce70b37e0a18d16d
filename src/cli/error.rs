//! Command-line error surface with actionable hints

use colored::Colorize;
use thiserror::Error;

/// Result alias for command execution
pub type CliResult<T> = Result<T, CliError>;

/// Errors surfaced to the terminal user
#[derive(Error, Debug)]
pub enum CliError {
    /// Bad or unreadable configuration file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Flag combination the commands cannot act on
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Bind or serve failure
    #[error("Server error: {0}")]
    Server(String),

    /// Filesystem trouble outside the studio itself
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything the studio session reports
    #[error(transparent)]
    Studio(#[from] crate::Error),

    /// Uncategorized CLI glue failures
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    /// Print a user-friendly error message with a hint where one helps.
    pub fn print_error(&self) {
        eprintln!("{} {}", "Error:".red().bold(), self);

        match self {
            CliError::Config(_) | CliError::Studio(crate::Error::Config(_)) => {
                eprintln!(
                    "\n{} Pass {} pointing at a YAML or JSON configuration file",
                    "Hint:".yellow(),
                    "--config".cyan()
                );
            }
            CliError::InvalidArgument(_) => {
                eprintln!(
                    "\n{} Use {} for more information",
                    "Hint:".yellow(),
                    "easel --help".cyan()
                );
            }
            CliError::Server(_) => {
                eprintln!(
                    "\n{} Check that the port is not already in use",
                    "Hint:".yellow()
                );
            }
            CliError::Studio(crate::Error::Download(_)) => {
                eprintln!(
                    "\n{} Check the model id and your network connection; local \
                     directories are used as-is",
                    "Hint:".yellow()
                );
            }
            _ => {}
        }
    }
}
