//! dockside - run process launches inside a Docker container
//!
//! This crate provides:
//! - A synchronous wrapper over the docker CLI
//! - Rewriting of process launches into `docker exec` against a running container
//! - Detection of whether the current process itself runs in a container
//! - A scoped container lifecycle that always stops what it started

pub mod cli;
pub mod config;
pub mod docker;
pub mod paths;

pub use config::Config;
