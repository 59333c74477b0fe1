//! CLI subcommand: `dockside inside`
//!
//! Starts a placeholder container, runs each command as `sh -c` through
//! `docker exec`, and stops the container afterwards. The first nonzero
//! exit ends the run and becomes the process exit status.

use anyhow::{Context, Result};
use clap::Args;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::docker::{
    CancelToken, ContainerSpec, DockerClient, EnvVars, LaunchRequest, SystemRunner, Volume,
    with_container,
};

#[derive(Args)]
pub struct InsideArgs {
    /// Image to start
    pub image: String,

    /// Extra `docker run` argument (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    pub run_args: Vec<String>,

    /// Bind mount HOST:CONTAINER, optionally suffixed :ro or :rw (repeatable)
    #[arg(long = "volume", value_name = "HOST:CONTAINER[:MODE]", value_parser = parse_volume)]
    pub volumes: Vec<Volume>,

    /// Workspace directory, mounted and used as the working directory [default: current dir]
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Temporary directory to mount alongside the workspace
    #[arg(long = "tmp", value_name = "DIR")]
    pub tmp_dir: Option<String>,

    /// Variable set for every command, KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,

    /// Variable set on the container itself at start, KEY=VALUE (repeatable)
    #[arg(long = "container-env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub container_env: Vec<(String, String)>,

    /// Variable whose value is masked in logs (repeatable)
    #[arg(long = "secret", value_name = "KEY")]
    pub secrets: Vec<String>,

    /// File with one command per line; blank lines and `#` comments are skipped
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Command to run (repeatable, runs after the script)
    #[arg(short, long = "command", value_name = "CMD")]
    pub commands: Vec<String>,
}

impl InsideArgs {
    fn all_commands(&self) -> Result<Vec<String>> {
        let mut commands = match self.script {
            Some(ref path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read script {}", path.display()))?;
                script_commands(&content)
            }
            None => Vec::new(),
        };
        commands.extend(self.commands.iter().cloned());
        Ok(commands)
    }

    fn container_spec(&self) -> Result<ContainerSpec> {
        let workdir = match self.workdir {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir()?.display().to_string(),
        };

        Ok(ContainerSpec {
            args: self.run_args.clone(),
            workdir: Some(workdir),
            tmp_dir: self.tmp_dir.clone(),
            volumes: self.volumes.clone(),
            env: self.container_env.iter().cloned().collect(),
            secret_keys: self.secrets.iter().cloned().collect::<BTreeSet<_>>(),
            ..ContainerSpec::new(self.image.clone())
        })
    }
}

pub async fn run(args: InsideArgs) -> Result<()> {
    let config = Config::load()?;
    let commands = args.all_commands()?;
    if commands.is_empty() {
        anyhow::bail!("Nothing to run: pass --command or --script");
    }

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the running command");
            trigger.cancel();
        }
    });

    let status = tokio::task::spawn_blocking(move || {
        let client = config.docker_client(Arc::new(SystemRunner));
        run_blocking(&client, &config, &args, &commands, cancel)
    })
    .await??;

    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}

/// Returns the first nonzero exit status, or 0 when every command succeeded.
fn run_blocking(
    client: &DockerClient,
    config: &Config,
    args: &InsideArgs,
    commands: &[String],
    cancel: CancelToken,
) -> Result<i32> {
    let spec = args.container_spec()?;
    let options = config.lifecycle_options(cancel);

    let mut step_env: EnvVars = options.host_env.clone();
    step_env.extend(args.env.iter().cloned());
    let pwd = spec.workdir.clone();

    with_container(client, spec, options, |scope| -> Result<i32> {
        for command in commands {
            let mut request = LaunchRequest::new(["sh", "-c", command.as_str()]).env(step_env.clone());
            if let Some(ref dir) = pwd {
                request = request.pwd(dir.clone());
            }

            info!("+ {}", command);
            let result = scope.launch(&request)?;
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);

            if !result.success() {
                warn!("Command exited with status {}: {}", result.status, command);
                return Ok(result.status);
            }
        }
        Ok(0)
    })
}

fn script_commands(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in `{}`", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_volume(s: &str) -> std::result::Result<Volume, String> {
    Volume::parse(s).ok_or_else(|| format!("expected HOST:CONTAINER[:ro|:rw], got `{}`", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use crate::docker::process::MockProcessRunner;
    use crate::docker::{CommandResult, ContainerizationDetector, Platform};
    use crate::paths::Paths;
    use clap::Parser;
    use mockall::Sequence;

    const ID: &str = "5e0c1b2a3d4f5e6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a";

    fn parse(argv: &[&str]) -> InsideArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Inside(args) => args,
            _ => panic!("expected inside"),
        }
    }

    #[test]
    fn key_values_split_at_first_equals() {
        assert_eq!(
            parse_key_val("URL=http://x?a=b").unwrap(),
            ("URL".to_string(), "http://x?a=b".to_string())
        );
        assert_eq!(parse_key_val("EMPTY=").unwrap().1, "");
        assert!(parse_key_val("NOVALUE").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn script_skips_blanks_and_comments() {
        let script = "# build\nmake\n\n   make test  \n#done\n";
        assert_eq!(script_commands(script), ["make", "make test"]);
    }

    #[test]
    fn arguments_build_container_spec() {
        let args = parse(&[
            "dockside",
            "inside",
            "maven:3",
            "--arg",
            "--network=host",
            "--volume",
            "/cache:/root/.m2",
            "--volume",
            "/srv/keys:/keys:ro",
            "-w",
            "/ws",
            "--tmp",
            "/ws@tmp",
            "-e",
            "TOKEN=abc",
            "--container-env",
            "TZ=UTC",
            "--secret",
            "TOKEN",
            "-c",
            "mvn -B verify",
        ]);

        assert_eq!(args.all_commands().unwrap(), ["mvn -B verify"]);
        assert_eq!(args.env, [("TOKEN".to_string(), "abc".to_string())]);

        let spec = args.container_spec().unwrap();
        assert_eq!(spec.image, "maven:3");
        assert_eq!(spec.args, ["--network=host"]);
        assert_eq!(spec.workdir.as_deref(), Some("/ws"));
        assert_eq!(spec.tmp_dir.as_deref(), Some("/ws@tmp"));
        assert_eq!(
            spec.volumes,
            vec![
                Volume::new("/cache", "/root/.m2"),
                Volume::new("/srv/keys", "/keys").read_only()
            ]
        );
        assert_eq!(spec.env.get("TZ").map(String::as_str), Some("UTC"));
        assert!(spec.secret_keys.contains("TOKEN"));
        assert_eq!(spec.command, ["cat"]);
    }

    #[test]
    fn script_commands_run_before_inline_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("steps.sh");
        std::fs::write(&script, "echo one\necho two\n").unwrap();

        let script_arg = script.display().to_string();
        let args = parse(&[
            "dockside",
            "inside",
            "alpine",
            "--script",
            script_arg.as_str(),
            "-c",
            "echo three",
        ]);
        assert_eq!(args.all_commands().unwrap(), ["echo one", "echo two", "echo three"]);
    }

    #[test]
    fn workdir_defaults_to_current_directory() {
        let args = parse(&["dockside", "inside", "alpine", "-c", "true"]);
        let spec = args.container_spec().unwrap();
        let cwd = std::env::current_dir().unwrap().display().to_string();
        assert_eq!(spec.workdir, Some(cwd));
    }

    #[test]
    fn malformed_volume_is_rejected() {
        let err = Cli::try_parse_from(["dockside", "inside", "alpine", "--volume", "/a:/b:nocopy"]);
        assert!(err.is_err());
    }

    fn exited(status: i32) -> CommandResult {
        CommandResult {
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn expect_op(
        runner: &mut MockProcessRunner,
        seq: &mut Sequence,
        operation: &'static str,
        stdout: &'static str,
    ) {
        runner
            .expect_run()
            .withf(move |inv| inv.operation == operation)
            .times(1)
            .in_sequence(seq)
            .returning(move |_| {
                Ok(CommandResult {
                    stdout: stdout.to_string(),
                    ..exited(0)
                })
            });
    }

    fn expect_exec(
        runner: &mut MockProcessRunner,
        seq: &mut Sequence,
        command: &'static str,
        status: i32,
    ) {
        runner
            .expect_run()
            .withf(move |inv| {
                inv.operation == "exec" && inv.argv.last().map(String::as_str) == Some(command)
            })
            .times(1)
            .in_sequence(seq)
            .returning(move |_| Ok(exited(status)));
    }

    #[test]
    fn first_failing_command_ends_the_run() {
        let mut runner = MockProcessRunner::new();
        let mut seq = Sequence::new();
        expect_op(&mut runner, &mut seq, "version", "Docker version 24.0.7, build afdd53b\n");
        expect_op(&mut runner, &mut seq, "run", ID);
        expect_op(
            &mut runner,
            &mut seq,
            "top",
            "UID PID PPID C STIME TTY TIME CMD\n1000 4122 4101 0 10:02 pts/0 00:00:00 cat\n",
        );
        expect_exec(&mut runner, &mut seq, "echo one", 0);
        expect_exec(&mut runner, &mut seq, "exit 3", 3);
        expect_op(&mut runner, &mut seq, "stop", ID);
        expect_op(&mut runner, &mut seq, "rm", ID);

        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config {
            paths: Paths {
                config_dir: tmp.path().join("config"),
                state_dir: tmp.path().join("state"),
            },
            ..Config::default()
        };
        config.docker.pull_missing = false;

        let detector =
            ContainerizationDetector::with_paths(tmp.path().join("cgroup"), tmp.path().join("mountinfo"));
        let client = DockerClient::new("docker", Platform::Unix, Arc::new(runner), EnvVars::new())
            .with_detector(detector);

        let args = parse(&[
            "dockside",
            "inside",
            "alpine",
            "-w",
            "/ws",
            "-c",
            "echo one",
            "-c",
            "exit 3",
            "-c",
            "echo three",
        ]);
        let commands = args.all_commands().unwrap();

        let status = run_blocking(&client, &config, &args, &commands, CancelToken::new()).unwrap();
        assert_eq!(status, 3);

        let store = crate::docker::HandleStore::new(config.paths.containers_dir());
        assert!(store.list().unwrap().is_empty());
    }
}
