//! Scoped container lifecycle: start a placeholder container, route launches
//! through `docker exec`, and stop it exactly once on the way out.
//!
//! ```text
//! NotStarted --start--> Running --teardown--> Stopped
//! ```
//!
//! Dropping a [`ContainerLifecycle`] tears it down, so early returns and
//! panics inside the scope still stop the container.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{DockerClient, RunRequest, Volume};
use super::decorator::{ExecDecorator, LaunchRequest};
use super::detect::is_under_mount;
use super::error::{DockerError, Result};
use super::process::{CancelToken, CommandResult, EnvVars, Invocation};
use super::record::HandleStore;
use super::version::{MINIMUM_VERSION, Version};

/// Environment variable carrying the per-launch kill fingerprint.
pub const PROCESS_COOKIE: &str = "DOCKSIDE_PROCESS_COOKIE";

/// Command that keeps the placeholder container alive.
const KEEPALIVE_COMMAND: &str = "cat";

/// Reference to one running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub image: String,
    /// CLI binary the container was started with.
    pub tool_path: String,
    /// Host environment at start time; launches only forward what differs.
    pub host_env: EnvVars,
    /// Default working directory inside the container.
    pub workdir: Option<String>,
}

/// What to start.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub image: String,
    pub args: Vec<String>,
    pub workdir: Option<String>,
    pub tmp_dir: Option<String>,
    pub volumes: Vec<Volume>,
    pub env: EnvVars,
    /// Empty means `cat`.
    pub command: Vec<String>,
    /// Keys whose values are masked in every rewritten command line.
    pub secret_keys: BTreeSet<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: vec![KEEPALIVE_COMMAND.to_string()],
            ..Self::default()
        }
    }

    fn keepalive(&self) -> bool {
        self.command.is_empty() || self.command == [KEEPALIVE_COMMAND]
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Bound on each rewritten launch.
    pub exec_timeout: Duration,
    pub pull_missing: bool,
    pub host_env: EnvVars,
    /// Interrupts launches; teardown ignores it.
    pub cancel: CancelToken,
    pub store: Option<HandleStore>,
}

impl LifecycleOptions {
    pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(3600);
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            exec_timeout: Self::DEFAULT_EXEC_TIMEOUT,
            pull_missing: false,
            host_env: EnvVars::new(),
            cancel: CancelToken::new(),
            store: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
}

pub struct ContainerLifecycle<'c> {
    client: &'c DockerClient,
    options: LifecycleOptions,
    state: LifecycleState,
    handle: Option<ContainerHandle>,
    version: Option<Version>,
    secret_keys: BTreeSet<String>,
}

impl<'c> ContainerLifecycle<'c> {
    pub fn new(client: &'c DockerClient, options: LifecycleOptions) -> Self {
        Self {
            client,
            options,
            state: LifecycleState::NotStarted,
            handle: None,
            version: None,
            secret_keys: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn handle(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    fn require(&self, expected: LifecycleState) -> Result<()> {
        if self.state != expected {
            return Err(DockerError::WrongState {
                actual: self.state,
                expected,
            });
        }
        Ok(())
    }

    /// Start the container described by `spec`.
    ///
    /// Nothing is started when the engine is too old or the volume policy
    /// cannot be decided. Once `docker run` has succeeded the lifecycle is
    /// `Running`, so any later failure here is still followed by teardown.
    pub fn start(&mut self, spec: ContainerSpec) -> Result<&ContainerHandle> {
        self.require(LifecycleState::NotStarted)?;

        let version = self.client.version()?;
        if let Some(found) = version {
            if found.is_older_than(&MINIMUM_VERSION) {
                return Err(DockerError::VersionTooOld {
                    found,
                    minimum: MINIMUM_VERSION,
                });
            }
            debug!("Docker version {}", found);
        }
        self.version = version;

        if self.options.pull_missing && !self.client.image_exists(&spec.image)? {
            info!("Pulling image {}", spec.image);
            self.client.pull(&spec.image)?;
        }

        let (volumes, volumes_from) = self.select_volumes(&spec)?;
        let keepalive = spec.keepalive();
        let command = if spec.command.is_empty() {
            vec![KEEPALIVE_COMMAND.to_string()]
        } else {
            spec.command
        };

        let request = RunRequest {
            image: spec.image.clone(),
            args: spec.args,
            workdir: spec.workdir.clone(),
            volumes,
            volumes_from,
            env: spec.env,
            user: self.client.who_am_i(),
            command,
        };
        let id = self.client.run(&request)?;
        info!("Started container {} from {}", id, spec.image);

        self.state = LifecycleState::Running;
        self.secret_keys = spec.secret_keys;
        let handle = ContainerHandle {
            id,
            image: spec.image,
            tool_path: self.client.tool_path().to_string(),
            host_env: self.options.host_env.clone(),
            workdir: spec.workdir,
        };

        if let Some(ref store) = self.options.store
            && let Err(e) = store.save(&handle)
        {
            warn!("Could not record container {}: {}", handle.id, e);
        }

        let id = handle.id.clone();
        self.handle = Some(handle);
        if keepalive {
            self.check_keepalive(&id)?;
        }

        self.handle.as_ref().ok_or(DockerError::WrongState {
            actual: self.state,
            expected: LifecycleState::Running,
        })
    }

    /// Volumes for the workspace and temp directories.
    ///
    /// When this process itself runs in a container, directories already
    /// mounted into it are shared with `--volumes-from` (once), since their
    /// host paths are unknown. Everything else is bind-mounted in place.
    fn select_volumes(&self, spec: &ContainerSpec) -> Result<(Vec<Volume>, Vec<String>)> {
        let mut volumes = spec.volumes.clone();
        let mut volumes_from = Vec::new();
        let targets = spec.workdir.iter().chain(spec.tmp_dir.iter());

        let Some(host_id) = self.client.container_id_if_containerized()? else {
            volumes.extend(targets.map(Volume::identity));
            return Ok((volumes, volumes_from));
        };

        let mounts = self.client.mounted_volumes(&host_id)?;
        let case_insensitive = self.client.platform().case_insensitive_paths();
        for dir in targets {
            let mounted = mounts
                .iter()
                .any(|mount| is_under_mount(dir, mount, case_insensitive));
            if mounted {
                if volumes_from.is_empty() {
                    debug!("{} is mounted into {}; sharing its volumes", dir, host_id);
                    volumes_from.push(host_id.clone());
                }
            } else {
                volumes.push(Volume::identity(dir));
            }
        }

        Ok((volumes, volumes_from))
    }

    fn check_keepalive(&self, container_id: &str) -> Result<()> {
        let processes = self.client.list_processes(container_id)?;
        if !processes.iter().any(|p| p == KEEPALIVE_COMMAND) {
            warn!(
                "Container {} is not running `{}` (found {:?}); the image ENTRYPOINT may ignore the command",
                container_id, KEEPALIVE_COMMAND, processes
            );
        }
        Ok(())
    }

    pub fn decorator(&self) -> Result<ExecDecorator<'_>> {
        self.require(LifecycleState::Running)?;
        let handle = self
            .handle
            .as_ref()
            .ok_or(DockerError::WrongState {
                actual: self.state,
                expected: LifecycleState::Running,
            })?;
        Ok(ExecDecorator::new(
            self.client,
            handle,
            self.version,
            &self.secret_keys,
        ))
    }

    /// Run `request` inside the container and wait for it.
    ///
    /// Each launch carries a fresh fingerprint variable. When the wait is
    /// cancelled or times out, the in-container processes carrying it are
    /// killed before the error is returned.
    pub fn launch(&self, request: &LaunchRequest) -> Result<CommandResult> {
        let decorator = self.decorator()?;
        if self.options.cancel.is_cancelled() {
            return Err(DockerError::Cancelled);
        }

        let fingerprint = process_cookie();
        let mut env = request.env.clone();
        env.extend(fingerprint.clone());
        let tagged = LaunchRequest {
            env,
            ..request.clone()
        };

        let decorated = decorator.decorate(&tagged);
        debug!("Executing: {}", decorated.display());

        let invocation = Invocation::new(
            "exec",
            decorated.cmd,
            decorated.env,
            self.options.exec_timeout,
        )
        .with_cancel(Some(self.options.cancel.clone()));

        match self.client.runner().run(&invocation) {
            Err(e) if e.is_cancelled() || e.is_timeout() => {
                match decorator.kill(&fingerprint) {
                    Ok(0) => debug!("No abandoned processes left in {}", decorator.handle().id),
                    Ok(n) => info!("Killed {} abandoned process(es) in {}", n, decorator.handle().id),
                    Err(kill_err) => warn!("Failed to kill abandoned processes: {}", kill_err),
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Stop and remove the container. Runs at most once; failures are logged.
    pub fn teardown(&mut self) {
        if self.state != LifecycleState::Running {
            return;
        }
        self.state = LifecycleState::Stopped;

        let Some(ref handle) = self.handle else {
            return;
        };
        info!("Stopping container {}", handle.id);
        if let Err(e) = self.client.stop(&handle.id) {
            warn!("Failed to stop container {}: {}", handle.id, e);
        }
        if let Some(ref store) = self.options.store
            && let Err(e) = store.remove(&handle.id)
        {
            warn!("Could not drop record of container {}: {}", handle.id, e);
        }
    }
}

impl Drop for ContainerLifecycle<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn process_cookie() -> EnvVars {
    EnvVars::from([(PROCESS_COOKIE.to_string(), uuid::Uuid::new_v4().to_string())])
}

/// Start a container, run `body` against it, and tear it down whatever the
/// body's outcome. The body's result is returned unchanged.
pub fn with_container<T, E, F>(
    client: &DockerClient,
    spec: ContainerSpec,
    options: LifecycleOptions,
    body: F,
) -> std::result::Result<T, E>
where
    E: From<DockerError>,
    F: FnOnce(&ContainerLifecycle<'_>) -> std::result::Result<T, E>,
{
    let mut lifecycle = ContainerLifecycle::new(client, options);
    lifecycle.start(spec)?;
    let outcome = body(&lifecycle);
    lifecycle.teardown();
    outcome
}
