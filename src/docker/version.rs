//! Engine version parsing and the capability checks that command synthesis
//! branches on.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

use super::error::{DockerError, Result};

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\D*(\d+)\.(\d+)\.(\d+)").expect("version pattern is valid")
});

/// Oldest engine with `docker exec`.
pub const MINIMUM_VERSION: Version = Version::new(1, 3, 0);

/// First engine accepting `exec --env`.
pub const ENV_FLAG_VERSION: Version = Version::new(1, 13, 0);

/// First engine accepting `exec --workdir`.
pub const WORKDIR_FLAG_VERSION: Version = Version::new(17, 12, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Extract `major.minor.patch` from a free-form banner such as
    /// `Docker version 1.5.0, build a8a31ef` or `17.03.1-ce`.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let caps = VERSION_PATTERN
            .captures(trimmed)
            .ok_or_else(|| DockerError::VersionUnparseable(trimmed.to_string()))?;

        let component = |i: usize| -> Result<u32> {
            caps[i]
                .parse()
                .map_err(|_| DockerError::VersionUnparseable(trimmed.to_string()))
        };

        Ok(Self::new(component(1)?, component(2)?, component(3)?))
    }

    pub fn is_at_least(&self, minimum: &Version) -> bool {
        self >= minimum
    }

    pub fn is_older_than(&self, other: &Version) -> bool {
        self < other
    }

    pub fn supports_env_flag(&self) -> bool {
        self.is_at_least(&ENV_FLAG_VERSION)
    }

    pub fn supports_workdir_flag(&self) -> bool {
        self.is_at_least(&WORKDIR_FLAG_VERSION)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
