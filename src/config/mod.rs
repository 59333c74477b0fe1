use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::docker::{
    CancelToken, DockerClient, EnvVars, HandleStore, LifecycleOptions, Platform, ProcessRunner,
};
use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// CLI binary; a bare name is looked up on PATH
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Engine endpoint exported as DOCKER_HOST; unset keeps the environment's
    #[serde(default)]
    pub host: Option<String>,

    /// Bound on every CLI call except pulls and launched commands
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bound on each command run inside the container
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,

    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,

    /// Pull the image before `run` when it is not present locally
    #[serde(default = "default_true")]
    pub pull_missing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_tool() -> String {
    "docker".to_string()
}
fn default_timeout_secs() -> u64 {
    180
}
fn default_exec_timeout_secs() -> u64 {
    3600
}
fn default_pull_timeout_secs() -> u64 {
    600
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            host: None,
            timeout_secs: default_timeout_secs(),
            exec_timeout_secs: default_exec_timeout_secs(),
            pull_timeout_secs: default_pull_timeout_secs(),
            pull_missing: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Keys accepted by `get_value` and `set_value`.
    pub const KEYS: &[&str] = &[
        "docker.tool",
        "docker.host",
        "docker.timeout_secs",
        "docker.exec_timeout_secs",
        "docker.pull_timeout_secs",
        "docker.pull_missing",
        "logging.level",
    ];

    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;
        Self::load_from(paths)
    }

    /// Load `paths.config_file()`, writing the commented template when absent.
    pub fn load_from(paths: Paths) -> Result<Self> {
        let path = paths.config_file();

        if !path.exists() {
            let config = Config {
                paths,
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.paths = paths;

        if let Some(ref host) = config.docker.host {
            config.docker.host = Some(expand_env(host));
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.paths.config_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["docker", "tool"] => Ok(self.docker.tool.clone()),
            ["docker", "host"] => Ok(self.docker.host.clone().unwrap_or_default()),
            ["docker", "timeout_secs"] => Ok(self.docker.timeout_secs.to_string()),
            ["docker", "exec_timeout_secs"] => Ok(self.docker.exec_timeout_secs.to_string()),
            ["docker", "pull_timeout_secs"] => Ok(self.docker.pull_timeout_secs.to_string()),
            ["docker", "pull_missing"] => Ok(self.docker.pull_missing.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["docker", "tool"] => self.docker.tool = value.to_string(),
            ["docker", "host"] => {
                self.docker.host = Some(value.to_string()).filter(|v| !v.is_empty())
            }
            ["docker", "timeout_secs"] => self.docker.timeout_secs = value.parse()?,
            ["docker", "exec_timeout_secs"] => self.docker.exec_timeout_secs = value.parse()?,
            ["docker", "pull_timeout_secs"] => self.docker.pull_timeout_secs = value.parse()?,
            ["docker", "pull_missing"] => self.docker.pull_missing = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// `docker.tool` with `~` expanded.
    pub fn tool_path(&self) -> String {
        shellexpand::tilde(&self.docker.tool).into_owned()
    }

    /// Environment for CLI invocations: `vars` plus the configured
    /// DOCKER_HOST. TLS settings pass through from `vars` untouched.
    pub fn launch_env<I>(&self, vars: I) -> EnvVars
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: EnvVars = vars.into_iter().collect();
        if let Some(ref host) = self.docker.host {
            env.insert("DOCKER_HOST".to_string(), host.clone());
        }
        env
    }

    pub fn docker_client(&self, runner: Arc<dyn ProcessRunner>) -> DockerClient {
        DockerClient::new(
            self.tool_path(),
            Platform::current(),
            runner,
            self.launch_env(std::env::vars()),
        )
        .with_timeout(Duration::from_secs(self.docker.timeout_secs))
        .with_pull_timeout(Duration::from_secs(self.docker.pull_timeout_secs))
    }

    pub fn lifecycle_options(&self, cancel: CancelToken) -> LifecycleOptions {
        LifecycleOptions {
            exec_timeout: Duration::from_secs(self.docker.exec_timeout_secs),
            pull_missing: self.docker.pull_missing,
            host_env: std::env::vars().collect(),
            cancel,
            store: Some(HandleStore::new(self.paths.containers_dir())),
        }
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# dockside configuration
# Auto-created on first run. Edit as needed.

[docker]
# CLI binary used for every engine call
tool = "docker"

# Engine endpoint; leave unset to use DOCKER_HOST from the environment
# host = "tcp://build-engine:2376"
# host = "${BUILD_DOCKER_HOST}"

# Seconds before a CLI call (run, stop, inspect, ...) is abandoned
timeout_secs = 180

# Seconds each command run inside the container may take
exec_timeout_secs = 3600

pull_timeout_secs = 600
pull_missing = true

[logging]
level = "info"
"#;
