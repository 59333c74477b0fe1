//! Bounded execution of external processes.
//!
//! Every docker CLI call and every rewritten in-container command goes
//! through a [`ProcessRunner`]. The system implementation waits with a
//! client-side time bound and can be interrupted by a [`CancelToken`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;
use wait_timeout::ChildExt;

use super::error::{DockerError, Result};

/// Ordered `KEY=VALUE` set.
pub type EnvVars = BTreeMap<String, String>;

/// How often a waiting runner checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Outcome of one external process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status; `-1` when the process was terminated by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Shared flag raised when the enclosing block is aborted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A fully specified process start.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Complete environment of the child; nothing is inherited.
    pub env: EnvVars,
    pub timeout: Duration,
    pub cancel: Option<CancelToken>,
    /// Short label used in errors, e.g. `run` or `exec`.
    pub operation: String,
}

impl Invocation {
    pub fn new(operation: &str, argv: Vec<String>, env: EnvVars, timeout: Duration) -> Self {
        Self {
            argv,
            env,
            timeout,
            cancel: None,
            operation: operation.to_string(),
        }
    }

    pub fn with_cancel(mut self, cancel: Option<CancelToken>) -> Self {
        self.cancel = cancel;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<CommandResult>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandResult> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| DockerError::UnexpectedFormat("empty command line".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| DockerError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = spawn_pipe_reader(child.stdout.take());
        let stderr = spawn_pipe_reader(child.stderr.take());

        // On timeout or cancellation the readers are left detached: an
        // orphaned grandchild may keep the pipes open indefinitely.
        let status = wait_bounded(&mut child, invocation)?;

        let stdout = collect_pipe(stdout);
        let stderr = collect_pipe(stderr);

        Ok(CommandResult {
            status,
            stdout,
            stderr,
        })
    }
}

fn wait_bounded(child: &mut Child, invocation: &Invocation) -> Result<i32> {
    let deadline = Instant::now() + invocation.timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            terminate(child);
            return Err(DockerError::Timeout {
                operation: invocation.operation.clone(),
                after: invocation.timeout,
            });
        }

        let slice = (deadline - now).min(CANCEL_POLL);
        if let Some(status) = child.wait_timeout(slice)? {
            return Ok(status.code().unwrap_or(-1));
        }

        if invocation
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
        {
            debug!("Cancelling {}", invocation.operation);
            terminate(child);
            return Err(DockerError::Cancelled);
        }
    }
}

fn terminate(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect_pipe(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
