//! On-disk records of running containers.
//!
//! A scope saves its handle when the container starts and removes it on
//! teardown, so a record that survives means the process died mid-scope.
//! `dockside reap` uses these to stop leftovers.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::error::{DockerError, Result};
use super::lifecycle::ContainerHandle;

#[derive(Debug, Clone)]
pub struct HandleStore {
    dir: PathBuf,
}

impl HandleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, container_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", container_id))
    }

    pub fn save(&self, handle: &ContainerHandle) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.record_path(&handle.id);
        let json = serde_json::to_string_pretty(handle).map_err(|source| DockerError::Record {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(&path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The record carries the host environment.
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        debug!("Recorded container {} at {}", handle.id, path.display());
        Ok(path)
    }

    /// Forget a container. Removing an absent record is not an error.
    pub fn remove(&self, container_id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(container_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(&self, path: &Path) -> Result<ContainerHandle> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| DockerError::Record {
            path: path.display().to_string(),
            source,
        })
    }

    /// Every readable record, sorted by container id. Unreadable files are
    /// skipped with a debug message.
    pub fn list(&self) -> Result<Vec<ContainerHandle>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut handles = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.load(&path) {
                Ok(handle) => handles.push(handle),
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(handles)
    }
}
