//! Detection of whether this process is itself running inside a container.
//!
//! Two strategies are tried in order:
//! 1. cgroup v1 membership (`/proc/self/cgroup`), where the container id is
//!    embedded in the hierarchy path.
//! 2. mount information (`/proc/self/mountinfo`), for cgroup v2 hosts where
//!    the cgroup path is just `/`. The engine bind-mounts `/etc/hostname`
//!    and friends out of its per-container directory, which names the id.

use regex::Regex;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::debug;

use super::error::{DockerError, Result};

static HEX_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9a-f]+").expect("hex pattern is valid"));

/// Hierarchy paths produced by container runtimes we know about.
static RUNTIME_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(docker|docker-[^/]+|ecs|kubepods[^/]*|actions_job)/")
        .expect("runtime prefix pattern is valid")
});

static MOUNTINFO_CONTAINER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/containers/([0-9a-f]{64})/").expect("mountinfo pattern is valid")
});

const CONTAINER_ID_LEN: usize = 64;

/// Files the engine bind-mounts into every container it starts.
const ENGINE_MANAGED_MOUNTS: [&str; 3] = ["/etc/hostname", "/etc/hosts", "/etc/resolv.conf"];

#[derive(Debug, Clone)]
pub struct ContainerizationDetector {
    cgroup_path: PathBuf,
    mountinfo_path: PathBuf,
}

impl Default for ContainerizationDetector {
    fn default() -> Self {
        Self {
            cgroup_path: PathBuf::from("/proc/self/cgroup"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
        }
    }
}

impl ContainerizationDetector {
    pub fn with_paths(cgroup_path: impl Into<PathBuf>, mountinfo_path: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_path: cgroup_path.into(),
            mountinfo_path: mountinfo_path.into(),
        }
    }

    /// Returns the id of the container this process runs in, or `None` when
    /// it runs directly on a host.
    ///
    /// Fails when a cgroup path names a known runtime but carries no
    /// extractable id; guessing "not containerized" there would lead to
    /// bind mounts of paths that do not exist on the engine host.
    pub fn detect(&self) -> Result<Option<String>> {
        if let Some(cgroups) = read_optional(&self.cgroup_path)? {
            if let Some(id) = parse_cgroup(&cgroups)? {
                debug!("Containerized per {}: {}", self.cgroup_path.display(), id);
                return Ok(Some(id));
            }
        }

        match read_optional(&self.mountinfo_path)? {
            Some(mountinfo) => {
                let id = parse_mountinfo(&mountinfo);
                if let Some(ref id) = id {
                    debug!("Containerized per {}: {}", self.mountinfo_path.display(), id);
                }
                Ok(id)
            }
            None => Ok(None),
        }
    }
}

fn read_optional(path: &std::path::Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse `hierarchy-id:subsystems:path` lines.
///
/// The rightmost 64-character hex token of a path wins, since nested
/// orchestrators stack ids and the innermost one comes last.
pub fn parse_cgroup(content: &str) -> Result<Option<String>> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.splitn(3, ':');
        let (Some(_), Some(_), Some(path)) = (fields.next(), fields.next(), fields.next()) else {
            debug!("Skipping malformed cgroup line: {}", line);
            continue;
        };

        let id = HEX_RUN
            .find_iter(path)
            .map(|m| m.as_str())
            .filter(|token| token.len() == CONTAINER_ID_LEN)
            .last();

        if let Some(id) = id {
            return Ok(Some(id.to_string()));
        }

        if RUNTIME_PREFIX.is_match(path) {
            return Err(DockerError::UnexpectedFormat(format!(
                "cgroup path {:?} looks like a container runtime but has no container id",
                path
            )));
        }
    }

    Ok(None)
}

/// Parse `/proc/<pid>/mountinfo` looking for the engine-managed mounts.
pub fn parse_mountinfo(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // id parent major:minor root mount-point ...
        let (root, mount_point) = (fields.get(3)?, fields.get(4)?);
        if !ENGINE_MANAGED_MOUNTS.contains(mount_point) {
            return None;
        }
        MOUNTINFO_CONTAINER
            .captures(root)
            .map(|caps| caps[1].to_string())
    })
}

/// Whether `dir` is reachable through an existing mount at `mount`.
///
/// Plain string prefix comparison; Windows paths compare case-insensitively.
pub fn is_under_mount(dir: &str, mount: &str, case_insensitive: bool) -> bool {
    if mount.is_empty() {
        return false;
    }
    if case_insensitive {
        dir.to_lowercase().starts_with(&mount.to_lowercase())
    } else {
        dir.starts_with(mount)
    }
}
