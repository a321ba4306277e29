//! Layer assembly: turning a dependency's built artifacts into an OCI layer.
//!
//! A generic artifact tree becomes a deterministic tar plus the two umoci
//! command argvs that apply it ("raw add-layer" with fixed history metadata
//! and "config" with environment and inferred entrypoint). A pre-built
//! compressed layer passes through unarchived with `compressed` set so the
//! consumer decompresses it first - umoci's add-layer step only accepts
//! uncompressed input.

use kiln_core::config::{SandboxOptions, FIXED_CREATED};
use kiln_core::error::{KilnError, Result};

use crate::archive::{archive_dir, ArchiveOptions};
use crate::store::{Store, TreeDigest};
use crate::target::Address;

/// Sandbox-relative path layer archives are staged at.
pub const LAYER_ARCHIVE_PATH: &str = "layers/image_layer.tar";

/// An artifact built by the surrounding build tool for one dependency.
#[derive(Debug, Clone)]
pub struct BuiltArtifact {
    /// Primary output path relative to the artifact tree root.
    pub relpath: String,
    /// Snapshot of the artifact tree.
    pub digest: TreeDigest,
    /// The blob at `relpath` is already a finished layer archive.
    ///
    /// An explicit flag, deliberately not inferred from the filename.
    pub prebuilt_layer: bool,
    /// The pre-built layer is gzip-compressed.
    pub compressed: bool,
}

impl BuiltArtifact {
    pub fn tree(relpath: impl Into<String>, digest: TreeDigest) -> Self {
        Self {
            relpath: relpath.into(),
            digest,
            prebuilt_layer: false,
            compressed: false,
        }
    }

    pub fn prebuilt(relpath: impl Into<String>, digest: TreeDigest, compressed: bool) -> Self {
        Self {
            relpath: relpath.into(),
            digest,
            prebuilt_layer: true,
            compressed,
        }
    }
}

/// One assembled OCI layer: the staged archive plus the command argvs
/// (without the tool path) that apply and configure it.
#[derive(Debug, Clone)]
pub struct ImageLayer {
    pub address: Address,
    /// Snapshot containing the staged layer archive.
    pub tar_digest: TreeDigest,
    /// Path the archive is staged at inside the snapshot.
    pub staged_path: String,
    /// Archive path referenced by `layer_command`, after any decompression.
    pub archive_path: String,
    /// `raw add-layer` argv tail.
    pub layer_command: Vec<String>,
    /// `config` argv tail.
    pub config_command: Vec<String>,
    /// The staged archive requires a gunzip step before add-layer.
    pub compressed: bool,
}

/// Assemble one dependency's artifacts into an `ImageLayer`.
///
/// All artifact trees merge into a single deterministic tar; the first
/// artifact's path becomes the inferred entrypoint. A single pre-built
/// layer artifact is passed through as-is; more than one is rejected
/// rather than silently dropped.
pub fn assemble_layer(
    store: &Store,
    options: &SandboxOptions,
    address: &Address,
    artifacts: &[BuiltArtifact],
) -> Result<ImageLayer> {
    let prebuilt: Vec<&BuiltArtifact> = artifacts.iter().filter(|a| a.prebuilt_layer).collect();
    if prebuilt.len() > 1 {
        return Err(KilnError::MultipleLayers {
            address: address.to_string(),
            count: prebuilt.len(),
        });
    }

    let (tar_digest, staged_path, archive_path, compressed) = match prebuilt.first() {
        Some(artifact) => {
            // The archive is used under its decompressed name; the consumer
            // inserts the gunzip step.
            let applied = artifact
                .relpath
                .strip_suffix(".gz")
                .unwrap_or(&artifact.relpath)
                .to_string();
            (
                artifact.digest.clone(),
                artifact.relpath.clone(),
                applied,
                artifact.compressed,
            )
        }
        None => {
            let merged = store.merge(&artifacts.iter().map(|a| &a.digest).collect::<Vec<_>>())?;
            let staging = tempfile::TempDir::new()
                .map_err(|e| KilnError::Sandbox(format!("failed to stage layer tree: {e}")))?;
            store.materialize(&merged.digest, staging.path())?;

            let tar = archive_dir(staging.path(), &ArchiveOptions::default())?;
            let snapshot = store.snapshot_from_files(&[(LAYER_ARCHIVE_PATH, &tar)])?;
            (
                snapshot.digest,
                LAYER_ARCHIVE_PATH.to_string(),
                LAYER_ARCHIVE_PATH.to_string(),
                false,
            )
        }
    };

    tracing::debug!(
        address = %address,
        archive = %staged_path,
        compressed,
        "assembled image layer"
    );

    let layer_command = vec![
        "raw".to_string(),
        "add-layer".to_string(),
        format!("--history.author={}", options.author),
        format!("--history.created_by=Layer target: {address}"),
        format!("--history.comment=Layer target: {address}"),
        format!("--history.created={FIXED_CREATED}"),
        "--image".to_string(),
        "build:build".to_string(),
        archive_path.clone(),
    ];

    let mut config_command = vec![
        "config".to_string(),
        "--config.env".to_string(),
        format!("BUILT_BY={}", options.built_by),
    ];
    if let Some(artifact) = artifacts.first() {
        config_command.push("--config.entrypoint".to_string());
        config_command.push(format!("/{}", artifact.relpath));
    }
    config_command.extend([
        format!("--author={}", options.author),
        format!("--created={FIXED_CREATED}"),
        "--no-history".to_string(),
        "--image".to_string(),
        "build:build".to_string(),
    ]);

    Ok(ImageLayer {
        address: address.clone(),
        tar_digest,
        staged_path,
        archive_path,
        layer_command,
        config_command,
        compressed,
    })
}

impl ImageLayer {
    /// Entrypoint declared by this layer's config command, if any.
    pub fn declared_entrypoint(&self) -> Option<&str> {
        let index = self
            .config_command
            .iter()
            .position(|arg| arg == "--config.entrypoint")?;
        self.config_command.get(index + 1).map(String::as_str)
    }

    /// Decompression argv for a compressed staged archive. gunzip rewrites
    /// the file in place under its stripped name.
    pub fn decompress_command(&self) -> Option<Vec<String>> {
        if self.compressed {
            Some(vec!["gunzip".to_string(), self.staged_path.clone()])
        } else {
            None
        }
    }
}
