//! Run process launches inside a Docker container.
//!
//! A [`ContainerLifecycle`] starts a long-lived placeholder container and
//! rewrites each launch into `docker exec` through an [`ExecDecorator`].
//! Everything talks to the engine through the `docker` CLI binary.

pub mod client;
pub mod decorator;
pub mod detect;
pub mod error;
pub mod lifecycle;
pub mod process;
pub mod record;
pub mod version;

pub use client::{DockerClient, Platform, RunRequest, Volume};
pub use decorator::{ExecDecorator, LaunchRequest, reduce_environment, render_masked};
pub use detect::ContainerizationDetector;
pub use error::{DockerError, Result};
pub use lifecycle::{
    ContainerHandle, ContainerLifecycle, ContainerSpec, LifecycleOptions, LifecycleState,
    with_container,
};
pub use process::{CancelToken, CommandResult, EnvVars, Invocation, ProcessRunner, SystemRunner};
pub use record::HandleStore;
pub use version::{MINIMUM_VERSION, Version};
