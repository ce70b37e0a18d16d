//! Terminal progress feedback for long-running phases

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::error::CliResult;

/// Spinner shown while a command is busy with a long blocking phase.
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter with indeterminate progress
    pub fn new(message: &str) -> CliResult<Self> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        Ok(Self { bar })
    }

    /// Update the progress message
    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Finish the progress bar with a completion message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish the progress bar and clear it
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}
