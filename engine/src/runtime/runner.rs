//! Running commands inside an image bundle.
//!
//! Composes unpack, config patching, runc execution and optional repack in
//! one sandbox. The unpacked tree is consumed by the patch step and the
//! patched config by runc, so the chain is strictly sequential.

use sha2::{Digest, Sha256};

use kiln_core::config::{SandboxOptions, Toolchain};
use kiln_core::error::Result;

use crate::image::{extract_image_sha, ImageBundle};
use crate::runtime::spec::{RunCommand, RuntimeConfig};
use crate::runtime::unpack::{repack_process, unpack_process, UNPACKED_DIR};
use crate::sandbox::Sandbox;
use crate::store::Store;
use crate::target::Address;

/// A request to run a command inside an image bundle.
#[derive(Debug, Clone)]
pub struct RunContainerRequest {
    pub bundle: ImageBundle,
    pub command: RunCommand,
    /// Capture the resulting filesystem as a new bundle.
    pub repack: bool,
    /// Leave the container attached to a terminal.
    pub interactive: bool,
}

impl RunContainerRequest {
    pub fn new(bundle: ImageBundle, command: impl Into<RunCommand>) -> Self {
        Self {
            bundle,
            command: command.into(),
            repack: false,
            interactive: false,
        }
    }

    pub fn with_repack(mut self) -> Self {
        self.repack = true;
        self
    }
}

/// Outcome of a container run. Non-zero exits are data; `repacked` is
/// present only when the run succeeded and repacking was requested.
#[derive(Debug, Clone)]
pub struct ContainerRunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub repacked: Option<ImageBundle>,
}

impl ContainerRunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Derive the runtime container name for a target address.
///
/// Stable across repeated runs of the same target and collision-free
/// across concurrent runs of different targets: sanitizing alone can
/// collide (`a/b` vs `a_b`), so a short content hash of the raw address is
/// appended.
pub fn container_name(address: &Address) -> String {
    let digest = hex::encode(Sha256::digest(address.as_str().as_bytes()));
    format!("kiln.runc.{}.{}", address.sanitized(), &digest[..10])
}

/// Runs commands inside image bundles.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    store: Store,
    options: SandboxOptions,
    toolchain: Toolchain,
}

impl ContainerRunner {
    pub fn new(store: Store, options: SandboxOptions, toolchain: Toolchain) -> Self {
        Self {
            store,
            options,
            toolchain,
        }
    }

    /// Run a command inside the bundle, optionally repacking the modified
    /// filesystem into a new bundle.
    pub async fn run(
        &self,
        address: &Address,
        request: &RunContainerRequest,
    ) -> Result<ContainerRunResult> {
        let sandbox = Sandbox::create(&self.store)?;
        sandbox.materialize(&request.bundle.digest)?;
        sandbox.create_dir("runspace")?;
        sandbox.create_dir("tmp")?;

        let env: std::collections::BTreeMap<String, String> = [(
            "XDG_RUNTIME_DIR".to_string(),
            sandbox.path().join("tmp").to_string_lossy().into_owned(),
        )]
        .into_iter()
        .collect();

        // Unpack the image into a runtime bundle.
        let unpack = unpack_process(&self.toolchain, &self.options, request.bundle.digest.clone());
        let step = sandbox.exec(&unpack.argv, &env).await?;
        if !step.success() {
            return Ok(ContainerRunResult {
                exit_code: step.exit_code,
                stdout: step.stdout,
                stderr: step.stderr,
                repacked: None,
            });
        }

        // Patch the runtime config in place.
        let config_path = sandbox.path().join(UNPACKED_DIR).join("config.json");
        let mut config = RuntimeConfig::load(&config_path)?;
        config.patch_for_run(&self.options, &request.command, request.interactive);
        config.save(&config_path)?;

        // Execute through the low-level runtime.
        let name = container_name(address);
        tracing::info!(container = %name, command = %request.command, "running container");
        let rootless = if self.options.rootless { "true" } else { "false" };
        let runc_argv = vec![
            self.toolchain.runc.to_string_lossy().into_owned(),
            "--root".to_string(),
            "runspace".to_string(),
            "--rootless".to_string(),
            rootless.to_string(),
            "run".to_string(),
            "-b".to_string(),
            UNPACKED_DIR.to_string(),
            name,
        ];
        let run_step = sandbox.exec(&runc_argv, &env).await?;
        if !run_step.success() {
            return Ok(ContainerRunResult {
                exit_code: run_step.exit_code,
                stdout: run_step.stdout,
                stderr: run_step.stderr,
                repacked: None,
            });
        }

        let mut result = ContainerRunResult {
            exit_code: 0,
            stdout: run_step.stdout,
            stderr: run_step.stderr,
            repacked: None,
        };

        if request.repack {
            let command = request.command.to_string();
            let repack = repack_process(&self.toolchain, &self.options, &command);
            let repack_step = sandbox.exec(&repack.argv, &env).await?;
            result.stdout.push_str(&repack_step.stdout);
            result.stderr.push_str(&repack_step.stderr);
            if !repack_step.success() {
                result.exit_code = repack_step.exit_code;
                return Ok(result);
            }

            let snapshot = sandbox.capture_outputs(&[], &["build".to_string()])?;
            let image_sha = extract_image_sha(&self.store, &snapshot.digest)?;
            result.repacked = Some(ImageBundle {
                digest: snapshot.digest,
                image_sha,
                is_local: true,
            });
        }

        Ok(result)
    }
}
