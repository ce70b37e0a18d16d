use clap::{Parser, Subcommand};
use easel::cli::{self, GenerateCommand, ServeCommand, TagsCommand};

#[derive(Parser)]
#[command(
    name = "easel",
    version,
    about = "Self-hosted Stable Diffusion studio with LoRA fusion and tag prompting",
    long_about = "easel serves a single-page Stable Diffusion studio: load SD 1.x or SDXL \
                  checkpoints, fuse LoRA adapters, sample Danbooru-style tag prompts, and \
                  render images from the browser or the command line."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Silence all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web studio
    Serve(ServeCommand),

    /// Generate images without the web UI
    Generate(GenerateCommand),

    /// Sample a tag prompt and print it
    Tags(TagsCommand),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::logging::init_logging(cli.verbose, cli.quiet, cli.json) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let result = match cli.command {
        Commands::Serve(cmd) => cli::commands::serve::execute(cmd).await,
        Commands::Generate(cmd) => cli::commands::generate::execute(cmd).await,
        Commands::Tags(cmd) => cli::commands::tags::execute(cmd).await,
    };

    if let Err(error) = result {
        error.print_error();
        std::process::exit(1);
    }
}
