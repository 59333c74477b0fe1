use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::docker::{HandleStore, MINIMUM_VERSION, Platform, SystemRunner};

#[derive(Args)]
pub struct StatusArgs {
    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct Status {
    tool: String,
    platform: Platform,
    /// None when the banner was not recognized
    version: Option<String>,
    supported: bool,
    env_flag: bool,
    workdir_flag: bool,
    /// Id of the container this process runs in
    containerized: Option<String>,
    recorded_containers: usize,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let config = Config::load()?;
    let status = tokio::task::spawn_blocking(move || collect(&config)).await??;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Docker CLI:");
    println!("  Tool:          {}", status.tool);
    println!("  Platform:      {:?}", status.platform);
    println!(
        "  Version:       {}",
        status.version.as_deref().unwrap_or("(unrecognized)")
    );
    println!(
        "  Supported:     {} (minimum {})",
        yes_no(status.supported),
        MINIMUM_VERSION
    );
    println!("  exec --env:     {}", yes_no(status.env_flag));
    println!("  exec --workdir: {}", yes_no(status.workdir_flag));
    println!();
    match status.containerized {
        Some(ref id) => println!("Running inside container {}", id),
        None => println!("Not running inside a container"),
    }
    if status.recorded_containers > 0 {
        println!(
            "{} recorded container(s) left behind; see `dockside reap`",
            status.recorded_containers
        );
    }

    Ok(())
}

fn collect(config: &Config) -> Result<Status> {
    let client = config.docker_client(Arc::new(SystemRunner));
    let version = client
        .version()
        .with_context(|| format!("Failed to query {}", client.tool_path()))?;
    let containerized = client.container_id_if_containerized()?;
    let recorded = HandleStore::new(config.paths.containers_dir()).list()?;

    Ok(Status {
        tool: client.tool_path().to_string(),
        platform: client.platform(),
        version: version.map(|v| v.to_string()),
        supported: version.is_none_or(|v| v.is_at_least(&MINIMUM_VERSION)),
        env_flag: version.is_none_or(|v| v.supports_env_flag()),
        workdir_flag: version.is_none_or(|v| v.supports_workdir_flag()),
        containerized,
        recorded_containers: recorded.len(),
    })
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
