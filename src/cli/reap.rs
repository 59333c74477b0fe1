//! CLI subcommand: `dockside reap`
//!
//! A scope records its container when it starts and drops the record on
//! teardown. Records that survive belong to runs that were killed outright;
//! this stops and removes those containers.

use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::docker::{DockerClient, HandleStore, SystemRunner};

#[derive(Args)]
pub struct ReapArgs {
    /// List what would be stopped without stopping anything
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(args: ReapArgs) -> Result<()> {
    let config = Config::load()?;
    tokio::task::spawn_blocking(move || {
        let client = config.docker_client(Arc::new(SystemRunner));
        let store = HandleStore::new(config.paths.containers_dir());
        reap(&client, &store, args.dry_run)
    })
    .await??;
    Ok(())
}

/// Returns how many containers were stopped (or would be, on a dry run).
fn reap(client: &DockerClient, store: &HandleStore, dry_run: bool) -> Result<usize> {
    let handles = store.list()?;
    if handles.is_empty() {
        println!("No recorded containers.");
        return Ok(0);
    }

    let mut reaped = 0;
    for handle in handles {
        let running = client.inspect(&handle.id, ".State.Running")?;
        let Some(running) = running else {
            println!("{} ({}) no longer exists", short_id(&handle.id), handle.image);
            if !dry_run {
                store.remove(&handle.id)?;
            }
            continue;
        };

        if dry_run {
            println!(
                "{} ({}) running={}",
                short_id(&handle.id),
                handle.image,
                running
            );
            reaped += 1;
            continue;
        }

        match client.stop(&handle.id) {
            Ok(()) => {
                println!("Stopped {} ({})", short_id(&handle.id), handle.image);
                store.remove(&handle.id)?;
                reaped += 1;
            }
            Err(e) => warn!("Failed to stop {}: {}", handle.id, e),
        }
    }

    Ok(reaped)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
