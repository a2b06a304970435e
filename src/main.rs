use anyhow::Result;
use clap::Parser;
use hcstool::{
    cli::Context,
    config::{Backend, ToolConfig},
    engine,
    shell::{self, Shell},
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hcstool")]
#[command(about = "Interactive shell for driving host compute systems", long_about = None)]
struct Cli {
    /// Run the commands in FILE instead of reading from the terminal
    #[arg(long, value_name = "FILE")]
    script: Option<PathBuf>,

    /// Config file override
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Engine backend
    #[arg(long, value_enum)]
    backend: Option<Backend>,

    /// Default wait budget for each command, in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_writer(std::io::stderr)
            .init();
    }

    shell::run_to_exit(run(cli))?
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => ToolConfig::load_from(path)?,
        None => ToolConfig::load()?,
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    let engine = engine::select(config.backend)?;
    tracing::debug!("Using the {} engine", engine.name());

    let mut shell = Shell::new(Context::new(engine, config));
    let result = match &cli.script {
        Some(path) => shell.run_script(path).await,
        None => shell.run_interactive().await,
    };
    shell.shutdown();

    result
}
