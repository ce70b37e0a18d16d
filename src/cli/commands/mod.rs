//! Subcommand implementations

pub mod generate;
pub mod serve;
pub mod tags;

pub use generate::GenerateCommand;
pub use serve::ServeCommand;
pub use tags::TagsCommand;
