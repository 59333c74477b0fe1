//! Rewrites process launches into `docker exec` invocations against a
//! running container, and kills in-container processes by environment
//! fingerprint.
//!
//! The decorator never starts the rewritten process itself; it hands back a
//! new [`LaunchRequest`] for whichever launcher the caller uses.

use std::collections::BTreeSet;
use tracing::debug;

use super::client::DockerClient;
use super::error::{DockerError, Result};
use super::lifecycle::ContainerHandle;
use super::process::EnvVars;
use super::version::Version;

/// Placeholder shown in logs instead of masked tokens.
pub const MASK: &str = "********";

/// A request to start a process, as issued by code inside a container scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchRequest {
    pub cmd: Vec<String>,
    /// Positional redaction flags for `cmd`; missing entries mean unmasked.
    pub masks: Vec<bool>,
    pub pwd: Option<String>,
    pub env: EnvVars,
}

impl LaunchRequest {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn pwd(mut self, pwd: impl Into<String>) -> Self {
        self.pwd = Some(pwd.into());
        self
    }

    pub fn env(mut self, env: EnvVars) -> Self {
        self.env = env;
        self
    }

    pub fn masks(mut self, masks: Vec<bool>) -> Self {
        self.masks = masks;
        self
    }

    /// Masks padded or truncated to the command length.
    fn aligned_masks(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.cmd.len()).map(|i| self.masks.get(i).copied().unwrap_or(false))
    }

    /// Command line with masked tokens replaced, for logging.
    pub fn display(&self) -> String {
        render_masked(&self.cmd, &self.masks)
    }
}

/// Variables the caller introduced on top of the host environment.
///
/// Drops every pair present with the same value on the host, and `PATH`
/// unconditionally: a host search path is meaningless inside the container.
pub fn reduce_environment(launch: &EnvVars, host: &EnvVars) -> EnvVars {
    launch
        .iter()
        .filter(|(key, value)| key.as_str() != "PATH" && host.get(*key) != Some(*value))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn render_masked(cmd: &[String], masks: &[bool]) -> String {
    cmd.iter()
        .enumerate()
        .map(|(i, arg)| {
            if masks.get(i).copied().unwrap_or(false) {
                MASK.to_string()
            } else if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{}\"", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quote a path for a POSIX single-quoted shell string.
fn shell_escape(path: &str) -> String {
    path.replace('\'', r#"'"'"'"#)
}

pub struct ExecDecorator<'a> {
    client: &'a DockerClient,
    handle: &'a ContainerHandle,
    version: Option<Version>,
    secret_keys: &'a BTreeSet<String>,
}

impl<'a> ExecDecorator<'a> {
    /// `version` of `None` means the banner was not recognized; the engine is
    /// then assumed to support both `--env` and `--workdir`.
    pub fn new(
        client: &'a DockerClient,
        handle: &'a ContainerHandle,
        version: Option<Version>,
        secret_keys: &'a BTreeSet<String>,
    ) -> Self {
        Self {
            client,
            handle,
            version,
            secret_keys,
        }
    }

    pub fn handle(&self) -> &ContainerHandle {
        self.handle
    }

    fn supports_env_flag(&self) -> bool {
        self.version.is_none_or(|v| v.supports_env_flag())
    }

    fn supports_workdir_flag(&self) -> bool {
        self.version.is_none_or(|v| v.supports_workdir_flag())
    }

    /// Rewrite `request` into an equivalent `docker exec` against the
    /// scope's container.
    pub fn decorate(&self, request: &LaunchRequest) -> LaunchRequest {
        let mut cmd: Vec<String> = vec![self.handle.tool_path.clone(), "exec".into()];
        let mut masks = vec![false, false];
        let mut shell_wrapper: Vec<String> = Vec::new();

        if let Some(ref pwd) = request.pwd
            && self.handle.workdir.as_deref() != Some(pwd.as_str())
        {
            if self.supports_workdir_flag() {
                cmd.push("--workdir".into());
                cmd.push(pwd.clone());
                masks.extend([false, false]);
            } else {
                shell_wrapper = vec![
                    "sh".into(),
                    "-c".into(),
                    format!("cd '{}'; exec \"$@\"", shell_escape(pwd)),
                    "--".into(),
                ];
            }
        }

        let reduced = reduce_environment(&request.env, &self.handle.host_env);
        if self.supports_env_flag() {
            for (key, value) in &reduced {
                cmd.push("--env".into());
                cmd.push(format!("{}={}", key, value));
                masks.extend([false, self.secret_keys.contains(key)]);
            }
            cmd.push(self.handle.id.clone());
            masks.push(false);
        } else {
            cmd.push(self.handle.id.clone());
            cmd.push("env".into());
            masks.extend([false, false]);
            for (key, value) in &reduced {
                cmd.push(format!("{}={}", key, value));
                masks.push(self.secret_keys.contains(key));
            }
        }

        masks.extend(std::iter::repeat_n(false, shell_wrapper.len()));
        cmd.extend(shell_wrapper);
        masks.extend(request.aligned_masks());
        cmd.extend(request.cmd.iter().cloned());

        LaunchRequest {
            cmd,
            masks,
            pwd: None,
            env: self.client.launch_env().clone(),
        }
    }

    /// Kill every in-container process whose command line and environment
    /// contain all of `fingerprint`'s `KEY=VALUE` pairs. Returns how many
    /// were signalled.
    ///
    /// Matching is plain substring search, so an unrelated process whose
    /// arguments happen to contain the same text is killed as well.
    pub fn kill(&self, fingerprint: &EnvVars) -> Result<usize> {
        if fingerprint.is_empty() {
            return Ok(0);
        }

        let id = self.handle.id.as_str();
        let listing: Vec<String> = ["exec", id, "ps", "-A", "-o", "pid,command", "e"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let table = self.client.execute("ps", &listing)?;
        if !table.success() {
            return Err(DockerError::command_failed("ps", table.status, &table.stderr));
        }

        let pids = matching_pids(&table.stdout, fingerprint);
        if pids.is_empty() {
            debug!("No process in {} matches the kill fingerprint", id);
            return Ok(0);
        }

        debug!("Killing pids {:?} in {}", pids, id);
        let mut kill: Vec<String> = vec!["exec".into(), id.into(), "kill".into()];
        kill.extend(pids.iter().cloned());
        let result = self.client.execute("kill", &kill)?;
        if !result.success() {
            return Err(DockerError::command_failed(
                "kill",
                result.status,
                &result.stderr,
            ));
        }

        Ok(pids.len())
    }
}

/// Leading pid of every process-table line containing all fingerprint pairs.
pub fn matching_pids(table: &str, fingerprint: &EnvVars) -> Vec<String> {
    let needles: Vec<String> = fingerprint
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    table
        .lines()
        .filter(|line| needles.iter().all(|needle| line.contains(needle.as_str())))
        .filter_map(|line| line.split_whitespace().next().map(String::from))
        .collect()
}
