//! Image targets and the build context boundary.
//!
//! Dependency resolution and artifact building live in the surrounding
//! build tool; kiln receives declarative `ImageTarget`s and a table of
//! already-built artifacts. Which builder handles a target is decided by
//! the field groups it populates, never by an explicit kind tag.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use kiln_core::config::{SandboxOptions, Toolchain};
use kiln_core::error::{KilnError, Result};

use crate::layer::BuiltArtifact;
use crate::store::Store;

/// Identifier of a target within the surrounding build graph,
/// e.g. `images/app:release`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Address with path separators flattened, usable as a file or
    /// container name component.
    pub fn sanitized(&self) -> String {
        self.0
            .chars()
            .map(|c| match c {
                '/' | ':' | '#' | '@' => '_',
                other => other,
            })
            .collect()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Declarative description of one image target.
///
/// Field groups determine which builder claims the target: the empty
/// marker, the pull group (`repository` + `pull_digest`), the build group
/// (`base`), or the python group (`python` + `base`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageTarget {
    pub address: Address,

    /// Marker for the canonical empty base image.
    #[serde(default)]
    pub empty: bool,

    /// Registry repository to pull from, e.g. `docker.io/library/alpine`.
    #[serde(default)]
    pub repository: Option<String>,
    /// Bare hex sha256 of the manifest to pull.
    #[serde(default)]
    pub pull_digest: Option<String>,
    /// Pull without credentials.
    #[serde(default)]
    pub anonymous: bool,
    /// Override the image operating system on pull.
    #[serde(default)]
    pub os: Option<String>,
    /// Override the image architecture on pull.
    #[serde(default)]
    pub arch: Option<String>,

    /// Base image target this build layers on top of.
    #[serde(default)]
    pub base: Option<Address>,
    /// Layer dependencies, applied in exactly this order.
    #[serde(default)]
    pub dependencies: Vec<Address>,
    /// Commands executed inside a throwaway bundle during the build.
    #[serde(default)]
    pub commands: Vec<String>,
    /// `KEY=VALUE` environment entries for the final image config.
    #[serde(default)]
    pub env: Vec<String>,
    /// Final image entrypoint.
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    /// Final image arguments (`config.cmd`).
    #[serde(default)]
    pub args: Vec<String>,

    /// Marker for the python-specialized builder.
    #[serde(default)]
    pub python: bool,
    /// Python entrypoint artifact; inferred from packaged artifacts when unset.
    #[serde(default)]
    pub main: Option<String>,
}

impl ImageTarget {
    /// The canonical empty base image target.
    pub fn empty(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            empty: true,
            ..Self::default()
        }
    }

    /// A target pulled from a registry by digest.
    pub fn pull(
        address: impl Into<Address>,
        repository: impl Into<String>,
        digest: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            repository: Some(repository.into()),
            pull_digest: Some(digest.into()),
            ..Self::default()
        }
    }

    /// A layered build on top of a base target.
    pub fn build(address: impl Into<Address>, base: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            base: Some(base.into()),
            ..Self::default()
        }
    }

    /// A python-specialized build on top of a base target.
    pub fn python(address: impl Into<Address>, base: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            base: Some(base.into()),
            python: true,
            ..Self::default()
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<Address>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }
}

impl From<&Address> for Address {
    fn from(address: &Address) -> Self {
        address.clone()
    }
}

/// Everything a build needs: the store, options, toolchain, and the
/// target and artifact tables registered by the surrounding build tool.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub store: Store,
    pub options: SandboxOptions,
    pub toolchain: Toolchain,
    targets: HashMap<Address, ImageTarget>,
    artifacts: HashMap<Address, Vec<BuiltArtifact>>,
}

impl BuildContext {
    pub fn new(store: Store, options: SandboxOptions, toolchain: Toolchain) -> Self {
        Self {
            store,
            options,
            toolchain,
            targets: HashMap::new(),
            artifacts: HashMap::new(),
        }
    }

    pub fn register_target(&mut self, target: ImageTarget) {
        self.targets.insert(target.address.clone(), target);
    }

    /// Register the built artifacts for a dependency address.
    pub fn register_artifacts(&mut self, address: impl Into<Address>, artifacts: Vec<BuiltArtifact>) {
        self.artifacts.insert(address.into(), artifacts);
    }

    pub fn target(&self, address: &Address) -> Result<&ImageTarget> {
        self.targets.get(address).ok_or_else(|| {
            KilnError::Config(format!("unknown target address `{address}`"))
        })
    }

    pub fn artifacts(&self, address: &Address) -> &[BuiltArtifact] {
        self.artifacts.get(address).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_sanitized() {
        let address = Address::new("images/app:release#1");
        assert_eq!(address.sanitized(), "images_app_release_1");
    }

    #[test]
    fn test_target_constructors_set_field_groups() {
        let empty = ImageTarget::empty("images/base");
        assert!(empty.empty);
        assert!(empty.base.is_none());

        let pull = ImageTarget::pull("images/alpine", "docker.io/library/alpine", "ab12");
        assert_eq!(pull.repository.as_deref(), Some("docker.io/library/alpine"));
        assert_eq!(pull.pull_digest.as_deref(), Some("ab12"));

        let build = ImageTarget::build("images/app", "images/base");
        assert_eq!(build.base, Some(Address::new("images/base")));
        assert!(!build.python);

        let python = ImageTarget::python("images/py", "images/base");
        assert!(python.python);
    }

    #[test]
    fn test_context_unknown_target_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let ctx = BuildContext::new(
            store,
            SandboxOptions::default(),
            Toolchain::with_paths("/bin/true", "/bin/true", "/bin/true"),
        );
        let result = ctx.target(&Address::new("missing"));
        assert!(matches!(result, Err(KilnError::Config(_))));
    }

    #[test]
    fn test_context_artifacts_default_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let ctx = BuildContext::new(
            store,
            SandboxOptions::default(),
            Toolchain::with_paths("/bin/true", "/bin/true", "/bin/true"),
        );
        assert!(ctx.artifacts(&Address::new("anything")).is_empty());
    }
}
