//! Synchronous wrapper over the docker CLI binary.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::decorator::render_masked;
use super::detect::ContainerizationDetector;
use super::error::{DockerError, Result};
use super::process::{CancelToken, CommandResult, EnvVars, Invocation, ProcessRunner};
use super::version::Version;

/// Go template listing the destinations of a container's mounts, one per line.
const MOUNT_DESTINATIONS: &str = "{{range .Mounts}}{{.Destination}}\n{{end}}";

/// Minimum columns in a `docker top` row: at least a pid and a command.
const TOP_MIN_COLUMNS: usize = 4;

/// `docker top` prints UID PID PPID C STIME TTY TIME CMD; CMD may contain spaces.
const TOP_COLUMNS: usize = 8;

/// Engine flavour the CLI talks to. Selected once when the client is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    /// Whether host paths compare case-insensitively.
    pub fn case_insensitive_paths(&self) -> bool {
        matches!(self, Platform::Windows)
    }

    fn volume_arg(&self, volume: &Volume) -> String {
        match (self, volume.read_only) {
            (_, true) => format!("{}:{}:ro", volume.host, volume.container),
            (Platform::Unix, false) => format!("{}:{}:rw", volume.host, volume.container),
            (Platform::Windows, false) => format!("{}:{}", volume.host, volume.container),
        }
    }
}

/// A `-v host:container[:ro|rw]` bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl Volume {
    pub fn new(host: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Same path on both sides.
    pub fn identity(path: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(path.clone(), path)
    }

    /// Parse `host:container[:ro|:rw]`. Leading drive letters (`C:`) on
    /// either side are not taken as separators; any other `:` in the
    /// container path is rejected.
    pub fn parse(spec: &str) -> Option<Self> {
        let split = find_separator(spec)?;
        let (host, rest) = (&spec[..split], &spec[split + 1..]);

        let (container, read_only) = match find_separator(rest) {
            Some(at) => match &rest[at + 1..] {
                "ro" => (&rest[..at], true),
                "rw" => (&rest[..at], false),
                _ => return None,
            },
            None => (rest, false),
        };

        if host.is_empty() || container.is_empty() {
            return None;
        }
        Some(Self {
            read_only,
            ..Self::new(host, container)
        })
    }
}

/// Position of the first `:` that is not part of a leading drive letter.
fn find_separator(path: &str) -> Option<usize> {
    let bytes = path.as_bytes();
    let skip = if bytes.len() > 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        2
    } else {
        0
    };
    Some(path[skip..].find(':')? + skip)
}

/// Arguments of a detached `docker run`.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub image: String,
    /// Extra user arguments, already tokenized.
    pub args: Vec<String>,
    pub workdir: Option<String>,
    pub volumes: Vec<Volume>,
    pub volumes_from: Vec<String>,
    pub env: EnvVars,
    pub user: Option<String>,
    pub command: Vec<String>,
}

pub struct DockerClient {
    tool_path: String,
    platform: Platform,
    runner: Arc<dyn ProcessRunner>,
    launch_env: EnvVars,
    timeout: Duration,
    pull_timeout: Duration,
    detector: ContainerizationDetector,
}

impl DockerClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

    pub fn new(
        tool_path: impl Into<String>,
        platform: Platform,
        runner: Arc<dyn ProcessRunner>,
        launch_env: EnvVars,
    ) -> Self {
        Self {
            tool_path: tool_path.into(),
            platform,
            runner,
            launch_env,
            timeout: Self::DEFAULT_TIMEOUT,
            pull_timeout: Self::DEFAULT_TIMEOUT,
            detector: ContainerizationDetector::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    pub fn with_detector(mut self, detector: ContainerizationDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn tool_path(&self) -> &str {
        &self.tool_path
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Environment the CLI itself runs with (engine endpoint, TLS material).
    pub fn launch_env(&self) -> &EnvVars {
        &self.launch_env
    }

    pub fn runner(&self) -> &dyn ProcessRunner {
        self.runner.as_ref()
    }

    /// Run `<tool> args...` under the client timeout.
    pub fn execute(&self, operation: &str, args: &[String]) -> Result<CommandResult> {
        self.execute_with(operation, args, self.timeout, None)
    }

    pub(crate) fn execute_with(
        &self,
        operation: &str,
        args: &[String],
        timeout: Duration,
        cancel: Option<CancelToken>,
    ) -> Result<CommandResult> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.tool_path.clone());
        argv.extend_from_slice(args);

        let invocation =
            Invocation::new(operation, argv, self.launch_env.clone(), timeout).with_cancel(cancel);
        let result = self.runner.run(&invocation)?;
        debug!("docker {} exited with {}", operation, result.status);
        Ok(result)
    }

    fn execute_checked(&self, operation: &str, args: &[String]) -> Result<CommandResult> {
        let result = self.execute(operation, args)?;
        if !result.success() {
            return Err(DockerError::command_failed(
                operation,
                result.status,
                &result.stderr,
            ));
        }
        Ok(result)
    }

    /// Argument list for `docker run`, with a parallel mask vector hiding
    /// container environment values from logs.
    pub fn run_args(&self, request: &RunRequest) -> (Vec<String>, Vec<bool>) {
        let mut args: Vec<String> = vec!["run".into(), "-t".into(), "-d".into()];

        if self.platform == Platform::Unix
            && let Some(ref user) = request.user
        {
            args.push("-u".into());
            args.push(user.clone());
        }

        args.extend(request.args.iter().cloned());

        if let Some(ref workdir) = request.workdir {
            args.push("-w".into());
            args.push(workdir.clone());
        }

        for volume in &request.volumes {
            args.push("-v".into());
            args.push(self.platform.volume_arg(volume));
        }

        for container in &request.volumes_from {
            args.push("--volumes-from".into());
            args.push(container.clone());
        }

        let mut masks = vec![false; args.len()];
        for (key, value) in &request.env {
            args.push("-e".into());
            masks.push(false);
            args.push(format!("{}={}", key, value));
            masks.push(true);
        }

        args.push(request.image.clone());
        args.extend(request.command.iter().cloned());
        masks.resize(args.len(), false);

        (args, masks)
    }

    /// Start a detached container; returns its id.
    pub fn run(&self, request: &RunRequest) -> Result<String> {
        let (args, masks) = self.run_args(request);
        debug!("Launching: {} {}", self.tool_path, render_masked(&args, &masks));

        let result = self.execute_checked("run", &args)?;
        let id = result.stdout.trim().to_string();
        if id.is_empty() {
            return Err(DockerError::UnexpectedFormat(
                "docker run printed no container id".to_string(),
            ));
        }
        Ok(id)
    }

    /// Stop the container, then remove it regardless of how `stop` went.
    pub fn stop(&self, container_id: &str) -> Result<()> {
        let stopped = self.execute_checked(
            "stop",
            &["stop".into(), "--time=1".into(), container_id.into()],
        );
        let removed = self.rm(container_id);
        stopped?;
        removed
    }

    pub fn rm(&self, container_id: &str) -> Result<()> {
        self.execute_checked("rm", &["rm".into(), "-f".into(), container_id.into()])?;
        Ok(())
    }

    /// Read one field, e.g. `.State.Running`. A missing object or field is
    /// `None`, not an error.
    pub fn inspect(&self, object_id: &str, field_path: &str) -> Result<Option<String>> {
        self.inspect_format(object_id, &format!("{{{{{}}}}}", field_path))
    }

    fn inspect_format(&self, object_id: &str, format: &str) -> Result<Option<String>> {
        let result = self.execute(
            "inspect",
            &[
                "inspect".into(),
                "-f".into(),
                format.into(),
                object_id.into(),
            ],
        )?;
        if !result.success() {
            return Ok(None);
        }
        Ok(Some(result.stdout.trim().to_string()))
    }

    /// Engine client version; `None` when the banner is not recognized.
    pub fn version(&self) -> Result<Option<Version>> {
        let result = self.execute_checked("version", &["-v".into()])?;
        match Version::parse(&result.stdout) {
            Ok(version) => Ok(Some(version)),
            Err(e) => {
                warn!("{}; assuming a recent engine", e);
                Ok(None)
            }
        }
    }

    /// Command names of the processes running in a container.
    pub fn list_processes(&self, container_id: &str) -> Result<Vec<String>> {
        let result = self.execute_checked("top", &["top".into(), container_id.into()])?;
        parse_top(&result.stdout)
    }

    /// `uid:gid` the container should run as so workspace files stay owned
    /// by the invoking user. Not applicable to Windows engines.
    pub fn who_am_i(&self) -> Option<String> {
        match self.platform {
            Platform::Unix => current_user(),
            Platform::Windows => None,
        }
    }

    pub fn container_id_if_containerized(&self) -> Result<Option<String>> {
        match self.platform {
            Platform::Unix => self.detector.detect(),
            Platform::Windows => Ok(None),
        }
    }

    /// Mount destinations of an existing container.
    pub fn mounted_volumes(&self, container_id: &str) -> Result<Vec<String>> {
        let output = self
            .inspect_format(container_id, MOUNT_DESTINATIONS)?
            .ok_or_else(|| {
                DockerError::command_failed("inspect", 1, &format!("no such container {}", container_id))
            })?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    pub fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.inspect_format(image, ".")?.is_some())
    }

    pub fn pull(&self, image: &str) -> Result<()> {
        let args = ["pull".to_string(), image.to_string()];
        let result = self.execute_with("pull", &args, self.pull_timeout, None)?;
        if !result.success() {
            return Err(DockerError::command_failed(
                "pull",
                result.status,
                &result.stderr,
            ));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn current_user() -> Option<String> {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some(format!("{}:{}", uid, gid))
}

#[cfg(not(unix))]
fn current_user() -> Option<String> {
    None
}

/// Extract the command column from `docker top` output.
pub fn parse_top(output: &str) -> Result<Vec<String>> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let columns = split_columns(line, TOP_COLUMNS);
            if columns.len() < TOP_MIN_COLUMNS {
                return Err(DockerError::UnexpectedFormat(format!(
                    "docker top row has {} columns: {:?}",
                    columns.len(),
                    line
                )));
            }
            Ok(columns[columns.len() - 1].to_string())
        })
        .collect()
}

/// Whitespace split into at most `limit` columns; the last keeps the rest of
/// the line.
fn split_columns(line: &str, limit: usize) -> Vec<&str> {
    let mut columns = Vec::with_capacity(limit);
    let mut rest = line.trim();
    while !rest.is_empty() {
        if columns.len() + 1 == limit {
            columns.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                columns.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                columns.push(rest);
                break;
            }
        }
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::process::MockProcessRunner;

    const ID: &str = "3dd988081e7149463c043b5d9c57d7309e079c5e9290f91feba1cc45a04d6a5b";

    fn ok(stdout: &str) -> CommandResult {
        CommandResult {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn failed(status: i32, stderr: &str) -> CommandResult {
        CommandResult {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn client(runner: MockProcessRunner, platform: Platform) -> DockerClient {
        let mut env = EnvVars::new();
        env.insert("DOCKER_HOST".into(), "tcp://engine:2376".into());
        DockerClient::new("/usr/bin/docker", platform, Arc::new(runner), env)
    }

    fn request() -> RunRequest {
        let mut env = EnvVars::new();
        env.insert("TOKEN".into(), "s3cret".into());
        RunRequest {
            image: "maven:3".into(),
            args: vec!["--network".into(), "host".into()],
            workdir: Some("/ws".into()),
            volumes: vec![Volume::identity("/ws"), Volume::identity("/ws@tmp")],
            volumes_from: vec![],
            env,
            user: Some("1000:1000".into()),
            command: vec!["cat".into()],
        }
    }

    #[test]
    fn unix_run_arguments() {
        let c = client(MockProcessRunner::new(), Platform::Unix);
        let (args, masks) = c.run_args(&request());
        assert_eq!(
            args,
            [
                "run", "-t", "-d", "-u", "1000:1000", "--network", "host", "-w", "/ws", "-v",
                "/ws:/ws:rw", "-v", "/ws@tmp:/ws@tmp:rw", "-e", "TOKEN=s3cret", "maven:3", "cat"
            ]
        );
        assert_eq!(masks.len(), args.len());
        let masked: Vec<&str> = args
            .iter()
            .zip(&masks)
            .filter(|(_, m)| **m)
            .map(|(a, _)| a.as_str())
            .collect();
        assert_eq!(masked, ["TOKEN=s3cret"]);
    }

    #[test]
    fn windows_run_arguments() {
        let c = client(MockProcessRunner::new(), Platform::Windows);
        let mut req = request();
        req.volumes_from = vec![ID.into()];
        let (args, _) = c.run_args(&req);
        assert!(!args.contains(&"-u".to_string()));
        assert!(args.contains(&"/ws:/ws".to_string()));
        let pos = args.iter().position(|a| a == "--volumes-from").unwrap();
        assert_eq!(args[pos + 1], ID);
    }

    #[test]
    fn run_returns_trimmed_id() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| {
                inv.argv[0] == "/usr/bin/docker"
                    && inv.argv[1] == "run"
                    && inv.env.get("DOCKER_HOST").map(String::as_str) == Some("tcp://engine:2376")
                    && inv.timeout == DockerClient::DEFAULT_TIMEOUT
            })
            .times(1)
            .returning(|_| Ok(ok(&format!("{}\n", ID))));

        let id = client(runner, Platform::Unix).run(&request()).unwrap();
        assert_eq!(id, ID);
    }

    #[test]
    fn run_failure_carries_stderr() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(failed(125, "Unable to find image 'nope:latest'\n")));

        let err = client(runner, Platform::Unix).run(&request()).unwrap_err();
        match err {
            DockerError::CommandFailed {
                operation,
                status,
                stderr,
            } => {
                assert_eq!(operation, "run");
                assert_eq!(status, 125);
                assert_eq!(stderr, "Unable to find image 'nope:latest'");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn stop_always_attempts_rm() {
        let mut runner = MockProcessRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .withf(|inv| inv.argv[1..] == ["stop", "--time=1", ID])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(failed(1, "No such container")));
        runner
            .expect_run()
            .withf(|inv| inv.argv[1..] == ["rm", "-f", ID])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok(ID)));

        let err = client(runner, Platform::Unix).stop(ID).unwrap_err();
        assert!(matches!(err, DockerError::CommandFailed { ref operation, .. } if operation == "stop"));
    }

    #[test]
    fn inspect_absent_field_is_none() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.argv[1..] == ["inspect", "-f", "{{.State.Running}}", ID])
            .returning(|_| Ok(failed(1, "template: :1:8: executing")));

        let value = client(runner, Platform::Unix)
            .inspect(ID, ".State.Running")
            .unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn inspect_present_field() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|_| Ok(ok("true\n")));

        let value = client(runner, Platform::Unix)
            .inspect(ID, ".State.Running")
            .unwrap();
        assert_eq!(value.as_deref(), Some("true"));
    }

    #[test]
    fn version_parses_banner() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.argv[1..] == ["-v"])
            .returning(|_| Ok(ok("Docker version 1.5.0, build a8a31ef\n")));

        let version = client(runner, Platform::Unix).version().unwrap();
        assert_eq!(version, Some(Version::new(1, 5, 0)));
    }

    #[test]
    fn version_unparseable_is_none() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(ok("Docker version master-dockerproject-2024\n")));

        assert_eq!(client(runner, Platform::Unix).version().unwrap(), None);
    }

    #[test]
    fn timeouts_propagate_with_their_tag() {
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|inv| {
            Err(DockerError::Timeout {
                operation: inv.operation.clone(),
                after: inv.timeout,
            })
        });

        let err = client(runner, Platform::Unix).rm(ID).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn top_output_is_parsed() {
        let output = "UID     PID    PPID   C   STIME   TTY     TIME       CMD\n\
                      1000    4122   4101   0   10:02   pts/0   00:00:00   cat\n\
                      1000    4300   4101   0   10:03   ?       00:00:01   sh -c make test\n";
        assert_eq!(parse_top(output).unwrap(), ["cat", "sh -c make test"]);
    }

    #[test]
    fn top_output_with_too_few_columns_fails() {
        let output = "PID CMD\n4122 cat\n";
        let err = parse_top(output).unwrap_err();
        assert!(matches!(err, DockerError::UnexpectedFormat(_)));
    }

    #[test]
    fn mounted_volumes_lists_destinations() {
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.argv[3] == MOUNT_DESTINATIONS)
            .returning(|_| Ok(ok("/var/run/docker.sock\n/home/jenkins\n\n")));

        let mounts = client(runner, Platform::Unix).mounted_volumes(ID).unwrap();
        assert_eq!(mounts, ["/var/run/docker.sock", "/home/jenkins"]);
    }

    #[test]
    fn windows_is_never_containerized() {
        let c = client(MockProcessRunner::new(), Platform::Windows);
        assert_eq!(c.container_id_if_containerized().unwrap(), None);
        assert_eq!(c.who_am_i(), None);
    }

    #[test]
    fn volume_spec_parsing() {
        assert_eq!(Volume::parse("/a:/b"), Some(Volume::new("/a", "/b")));
        assert_eq!(Volume::parse(r"C:\src:C:\dst"), Some(Volume::new(r"C:\src", r"C:\dst")));
        assert_eq!(Volume::parse("/a"), None);
        assert_eq!(Volume::parse(":/b"), None);
        assert_eq!(Volume::parse("/a:/b:rw"), Some(Volume::new("/a", "/b")));
        assert_eq!(Volume::parse(r"C:\src:C:\dst:ro"), Some(Volume::new(r"C:\src", r"C:\dst").read_only()));
        assert_eq!(Volume::parse("/a:/b:z"), None);
        assert_eq!(Volume::parse("/a:/b:ro:rw"), None);
    }

    #[test]
    fn read_only_mount_keeps_its_mode() {
        let volume = Volume::parse("/cache:/root/.m2:ro").unwrap();
        assert_eq!(volume, Volume::new("/cache", "/root/.m2").read_only());

        let mut req = request();
        req.volumes = vec![volume];
        let (args, _) = client(MockProcessRunner::new(), Platform::Unix).run_args(&req);
        assert!(args.contains(&"/cache:/root/.m2:ro".to_string()));
        assert!(!args.iter().any(|a| a.ends_with(":ro:rw")));

        let (args, _) = client(MockProcessRunner::new(), Platform::Windows).run_args(&req);
        assert!(args.contains(&"/cache:/root/.m2:ro".to_string()));
    }
}
