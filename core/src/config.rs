//! Explicit configuration threaded through the build and run pipeline.
//!
//! There is no ambient global state: every operation receives the options
//! and toolchain it needs as arguments.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};

/// Fixed creation timestamp stamped into every image and layer.
///
/// Keeping all timestamps at the epoch is what makes repeated builds of the
/// same inputs produce identical digests.
pub const FIXED_CREATED: &str = "1970-01-01T00:00:00Z";

/// One `containerID:hostID:size` UID/GID mapping triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First ID inside the container namespace
    pub container_id: u32,
    /// First ID on the host the range maps to
    pub host_id: u32,
    /// Number of IDs in the range
    pub size: u32,
}

impl IdMapping {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Render as the `container:host:size` flag value umoci expects.
    pub fn as_flag(&self) -> String {
        format!("{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

impl FromStr for IdMapping {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(KilnError::Config(format!(
                "invalid ID mapping `{s}`: expected container:host:size"
            )));
        }
        let parse = |field: &str, value: &str| -> Result<u32> {
            value.parse().map_err(|_| {
                KilnError::Config(format!("invalid ID mapping `{s}`: {field} is not a number"))
            })
        };
        Ok(Self {
            container_id: parse("container ID", parts[0])?,
            host_id: parse("host ID", parts[1])?,
            size: parse("size", parts[2])?,
        })
    }
}

impl std::fmt::Display for IdMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_flag())
    }
}

/// Options governing sandboxed image builds and container runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOptions {
    /// Run the container runtime without host privileges.
    pub rootless: bool,
    /// Ordered UID mappings injected into unpack and runtime config.
    pub uid_map: Vec<IdMapping>,
    /// Ordered GID mappings injected into unpack and runtime config.
    pub gid_map: Vec<IdMapping>,
    /// Shell used to wrap commands executed inside a container.
    pub command_shell: Vec<String>,
    /// Value of the `BUILT_BY` environment variable stamped into images.
    pub built_by: String,
    /// Author recorded in image and layer history metadata.
    pub author: String,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            rootless: true,
            uid_map: vec![IdMapping::new(0, 1000, 1)],
            gid_map: vec![IdMapping::new(0, 1000, 1)],
            command_shell: vec!["/bin/sh".to_string(), "-c".to_string()],
            built_by: "kiln.oci".to_string(),
            author: "kiln".to_string(),
        }
    }
}

/// Locations of the external binaries the engine drives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolchain {
    /// OCI image manipulation tool (umoci-compatible)
    pub umoci: PathBuf,
    /// Low-level container runtime (runc-compatible)
    pub runc: PathBuf,
    /// Registry copy tool (skopeo-compatible)
    pub skopeo: PathBuf,
}

impl Toolchain {
    /// Build a toolchain from explicit binary paths.
    pub fn with_paths(
        umoci: impl Into<PathBuf>,
        runc: impl Into<PathBuf>,
        skopeo: impl Into<PathBuf>,
    ) -> Self {
        Self {
            umoci: umoci.into(),
            runc: runc.into(),
            skopeo: skopeo.into(),
        }
    }

    /// Locate all required tools on the current `PATH`.
    pub fn discover() -> Result<Self> {
        let path = std::env::var("PATH").unwrap_or_default();
        let search: Vec<PathBuf> = std::env::split_paths(&path).collect();
        Self::discover_in(&search)
    }

    /// Locate all required tools in an explicit search path list.
    pub fn discover_in(search: &[PathBuf]) -> Result<Self> {
        Ok(Self {
            umoci: find_binary("umoci", search)?,
            runc: find_binary("runc", search)?,
            skopeo: find_binary("skopeo", search)?,
        })
    }
}

/// Search an ordered path list for an executable with the given name.
fn find_binary(name: &str, search: &[PathBuf]) -> Result<PathBuf> {
    for dir in search {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(KilnError::ToolNotFound {
        name: name.to_string(),
    })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
