use anyhow::Result;
use clap::Parser;

use dockside::cli::{self, Cli, Commands};
use dockside::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Initialize logging
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::load()
            .map(|config| config.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    match cli.command {
        Commands::Inside(args) => cli::inside::run(args).await,
        Commands::Status(args) => cli::status::run(args).await,
        Commands::Reap(args) => cli::reap::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
