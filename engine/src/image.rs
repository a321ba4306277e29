//! Image bundle model and manifest digest extraction.
//!
//! An `ImageBundle` is an immutable snapshot of an OCI layout directory
//! plus the manifest digest it resolves to. `FallibleImageBundle` is the
//! standard fallible wrapper: external tool failures are carried as data
//! with the captured output and the build phase they occurred in, and a
//! failed dependency is tagged distinctly from a local failure.

use oci_spec::image::ImageIndex;

use kiln_core::error::{KilnError, Result};

use crate::sandbox::ExecutionResult;
use crate::store::{Store, TreeDigest};

/// A built OCI image bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBundle {
    /// Snapshot of the OCI layout directory (`build/...`)
    pub digest: TreeDigest,
    /// Manifest digest, `sha256:<hex>`
    pub image_sha: String,
    /// Whether the bundle was produced locally or pulled from a registry
    pub is_local: bool,
}

/// The build phase a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Pulling,
    Layering,
    Configuring,
    Running,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            BuildPhase::Pulling => "pulling",
            BuildPhase::Layering => "layering",
            BuildPhase::Configuring => "configuring",
            BuildPhase::Running => "running",
        };
        write!(f, "{phase}")
    }
}

/// Fallible version of `ImageBundle` with failure details.
///
/// Never constructed by throwing: a tool exiting non-zero becomes a value
/// that bubbles through every composing build step.
#[derive(Debug, Clone)]
pub struct FallibleImageBundle {
    pub output: Option<ImageBundle>,
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Set when a base or layer dependency failed; no tool was invoked
    /// for this step.
    pub dependency_failed: bool,
    /// Phase the failure occurred in, if any.
    pub phase: Option<BuildPhase>,
}

impl FallibleImageBundle {
    pub fn success(bundle: ImageBundle) -> Self {
        Self {
            output: Some(bundle),
            exit_code: 0,
            stdout: None,
            stderr: None,
            dependency_failed: false,
            phase: None,
        }
    }

    /// Wrap a failed tool execution.
    pub fn tool_failure(result: &ExecutionResult, phase: BuildPhase) -> Self {
        Self {
            output: None,
            exit_code: result.exit_code,
            stdout: Some(result.stdout.clone()),
            stderr: Some(result.stderr.clone()),
            dependency_failed: false,
            phase: Some(phase),
        }
    }

    /// Propagate a failed dependency without invoking any tool.
    pub fn dependency_failure(&self) -> Self {
        Self {
            output: None,
            exit_code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            dependency_failed: true,
            phase: self.phase,
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.is_some()
    }

    /// Human-readable failure summary, surfacing the failing tool's
    /// captured output and the phase it failed in.
    pub fn message(&self) -> String {
        let mut message = match (&self.output, self.phase) {
            (Some(_), _) => "build succeeded.".to_string(),
            (None, Some(phase)) => {
                format!("build failed while {phase} (exit code {}).", self.exit_code)
            }
            (None, None) => format!("build failed (exit code {}).", self.exit_code),
        };
        if self.dependency_failed {
            message.push_str(" A dependency failed; no tool was invoked for this step.");
        }
        if let Some(stdout) = &self.stdout {
            if !stdout.is_empty() {
                message.push('\n');
                message.push_str(stdout);
            }
        }
        if let Some(stderr) = &self.stderr {
            if !stderr.is_empty() {
                message.push('\n');
                message.push_str(stderr);
            }
        }
        message
    }
}

/// Extract the manifest digest from a bundle's `build/index.json`.
///
/// The layout accumulates one manifest entry per configuration pass; the
/// last entry is the current image. A bundle without a parsable index is
/// corrupt and aborts the build.
pub fn extract_image_sha(store: &Store, digest: &TreeDigest) -> Result<String> {
    let data = store
        .read_file(digest, "build/index.json")?
        .ok_or_else(|| {
            KilnError::MalformedImageMetadata(
                "did not find `build/index.json` in image bundle".to_string(),
            )
        })?;

    let index: ImageIndex = serde_json::from_slice(&data).map_err(|e| {
        KilnError::MalformedImageMetadata(format!("failed to parse build/index.json: {e}"))
    })?;

    let manifest = index.manifests().last().ok_or_else(|| {
        KilnError::MalformedImageMetadata("build/index.json contains no manifests".to_string())
    })?;

    Ok(manifest.digest().to_string())
}
