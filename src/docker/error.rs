use std::time::Duration;

use thiserror::Error;

use super::lifecycle::LifecycleState;
use super::version::Version;

/// Failures surfaced by the docker client, decorator and lifecycle.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The engine cannot support `exec`-based decoration at all.
    #[error("docker {found} is older than the minimum supported version {minimum}")]
    VersionTooOld { found: Version, minimum: Version },

    #[error("unrecognized docker version banner: {0:?}")]
    VersionUnparseable(String),

    /// A CLI invocation exited nonzero where zero was required.
    #[error("docker {operation} failed with exit status {status}: {stderr}")]
    CommandFailed {
        operation: String,
        status: i32,
        stderr: String,
    },

    #[error("docker {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("operation cancelled")]
    Cancelled,

    /// Output that does not have the structure the caller relies on.
    #[error("unexpected format: {0}")]
    UnexpectedFormat(String),

    /// The lifecycle is not in the state the operation requires.
    #[error("container lifecycle is {actual:?}, expected {expected:?}")]
    WrongState {
        actual: LifecycleState,
        expected: LifecycleState,
    },

    #[error("invalid container record {path}: {source}")]
    Record {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DockerError {
    pub(crate) fn command_failed(operation: &str, status: i32, stderr: &str) -> Self {
        DockerError::CommandFailed {
            operation: operation.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        }
    }

    /// True when the failure came from the client-side time bound, so the
    /// caller may choose to retry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DockerError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DockerError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, DockerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_trims_stderr() {
        let err = DockerError::command_failed("run", 125, "  no such image\n");
        assert_eq!(
            err.to_string(),
            "docker run failed with exit status 125: no such image"
        );
    }

    #[test]
    fn timeout_is_tagged() {
        let err = DockerError::Timeout {
            operation: "stop".into(),
            after: Duration::from_secs(3),
        };
        assert!(err.is_timeout());
        assert!(!DockerError::Cancelled.is_timeout());
        assert!(DockerError::Cancelled.is_cancelled());
    }
}
