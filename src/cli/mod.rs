pub mod config;
pub mod inside;
pub mod paths;
pub mod reap;
pub mod status;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "dockside")]
#[command(author, version, about = "Run commands inside a throwaway Docker container")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a container, run commands in it through `docker exec`, then stop it
    Inside(inside::InsideArgs),

    /// Show the docker CLI version, capabilities and containerization
    Status(status::StatusArgs),

    /// Stop containers left behind by scopes that never tore down
    Reap(reap::ReapArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
