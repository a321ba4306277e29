//! Collecting files out of a built image.
//!
//! Unpacks a bundle, gathers declared output files and directories from
//! its `rootfs/`, and archives them deterministically. The archive is
//! gzipped when the requested name says so.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_core::config::{SandboxOptions, Toolchain};
use kiln_core::error::{KilnError, Result};

use crate::archive::{archive_dir, ArchiveOptions};
use crate::image::ImageBundle;
use crate::runtime::unpack::{unpack_process, UNPACKED_DIR};
use crate::sandbox::{ExecutionResult, Sandbox};
use crate::store::Store;

/// A request to collect files from a bundle into an archive.
#[derive(Debug, Clone)]
pub struct CopyFromRequest {
    pub bundle: ImageBundle,
    /// Archive file name; a `.gz` suffix selects gzip output.
    pub archive_name: String,
    /// Files to collect, relative to `rootfs/`.
    pub output_files: Vec<String>,
    /// Directories to collect, relative to `rootfs/`.
    pub output_dirs: Vec<String>,
    /// Exclude patterns applied while archiving.
    pub exclude: Vec<String>,
}

/// Unpack the bundle and archive the requested `rootfs/` content.
///
/// On success the result's output snapshot holds the archive under
/// `archive_name`. An unpack failure is returned as data.
pub async fn copy_from_container(
    store: &Store,
    options: &SandboxOptions,
    toolchain: &Toolchain,
    request: &CopyFromRequest,
) -> Result<ExecutionResult> {
    let sandbox = Sandbox::create(store)?;
    sandbox.materialize(&request.bundle.digest)?;

    let unpack = unpack_process(toolchain, options, request.bundle.digest.clone());
    let env = BTreeMap::new();
    let step = sandbox.exec(&unpack.argv, &env).await?;
    if !step.success() {
        return Ok(ExecutionResult {
            exit_code: step.exit_code,
            stdout: step.stdout,
            stderr: step.stderr,
            output: None,
        });
    }

    let rootfs = sandbox.path().join(UNPACKED_DIR).join("rootfs");
    let staging = tempfile::TempDir::new()
        .map_err(|e| KilnError::Sandbox(format!("failed to create copy staging dir: {e}")))?;

    for dir in &request.output_dirs {
        let source = rootfs.join(dir);
        if !source.is_dir() {
            return Err(KilnError::Sandbox(format!(
                "directory `{dir}` does not exist in the image rootfs"
            )));
        }
        copy_tree(&source, &staging.path().join(dir))?;
    }
    for file in &request.output_files {
        let source = rootfs.join(file);
        if !source.is_file() {
            return Err(KilnError::Sandbox(format!(
                "file `{file}` does not exist in the image rootfs"
            )));
        }
        let dest = staging.path().join(file);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, &dest)?;
    }

    let archive_options = ArchiveOptions {
        gzip: request.archive_name.ends_with(".gz"),
        exclude: request.exclude.clone(),
    };
    let archive = archive_dir(staging.path(), &archive_options)?;
    let snapshot = store.snapshot_from_files(&[(request.archive_name.as_str(), &archive)])?;

    Ok(ExecutionResult {
        exit_code: 0,
        stdout: step.stdout,
        stderr: step.stderr,
        output: Some(snapshot),
    })
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let metadata = std::fs::symlink_metadata(&from)?;
        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if metadata.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuilderRegistry;
    use crate::target::{Address, BuildContext, ImageTarget};

    // Drives real umoci; skipped when the toolchain is absent.
    #[tokio::test]
    async fn test_copy_from_empty_image_produces_archive() {
        let Ok(toolchain) = Toolchain::discover() else {
            return;
        };
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("store")).unwrap();
        let options = SandboxOptions::default();
        let mut ctx = BuildContext::new(store.clone(), options.clone(), toolchain.clone());
        ctx.register_target(ImageTarget::empty("images/base"));

        let registry = BuilderRegistry::with_default_builders();
        let built = registry
            .build_address(&ctx, &Address::new("images/base"))
            .await
            .unwrap();
        let bundle = built.output.expect("empty build succeeds");

        let request = CopyFromRequest {
            bundle,
            archive_name: "collected.tar.gz".to_string(),
            output_files: Vec::new(),
            output_dirs: Vec::new(),
            exclude: Vec::new(),
        };
        let result = copy_from_container(&store, &options, &toolchain, &request)
            .await
            .unwrap();

        assert!(result.success());
        let snapshot = result.output.unwrap();
        let archive = store
            .read_file(&snapshot.digest, "collected.tar.gz")
            .unwrap()
            .unwrap();
        assert_eq!(&archive[0..2], &[0x1f, 0x8b]);
    }
}
