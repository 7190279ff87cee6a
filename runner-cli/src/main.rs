// Pipeline Runner CLI
// Inspect bitbucket-pipelines.yml files and manage local step caches

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::cache::CacheArgs;
use commands::list::ListArgs;
use commands::parse::ParseArgs;
use commands::validate::ValidateArgs;

/// Run Bitbucket pipelines locally
#[derive(Parser, Debug)]
#[command(name = "pipeline-runner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the parsed specification, or one pipeline, as JSON or YAML
    Parse(ParseArgs),

    /// List the pipelines defined by the repository
    List(ListArgs),

    /// Parse the pipeline file and check its cross-references
    Validate(ValidateArgs),

    /// Inspect, clear or synchronize local caches
    Cache(CacheArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Parse(args) => commands::parse::execute(args),
        Commands::List(args) => commands::list::execute(args),
        Commands::Validate(args) => commands::validate::execute(args),
        Commands::Cache(args) => commands::cache::execute(args).await,
    }
}

/// `RUST_LOG` wins over the verbosity flag
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
