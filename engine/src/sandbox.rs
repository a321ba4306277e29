//! Sandboxed execution of process descriptions.
//!
//! A `Sandbox` is a scratch directory the input snapshot is materialized
//! into once; every argv in a chain executes with the sandbox root as its
//! working directory. Declared outputs are captured back into the store as
//! a new snapshot. Non-zero exits are returned as data, never as errors -
//! only sandbox setup and output capture can fail hard.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tempfile::TempDir;

use kiln_core::error::{KilnError, Result};

use crate::process::{FusedProcess, Process};
use crate::store::{Snapshot, Store, TreeDigest};

/// Outcome of a sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Captured declared outputs; present only on success.
    pub output: Option<Snapshot>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Digest of the captured output tree.
    ///
    /// Callers check `success()` first; a failed execution has no output.
    pub fn output_digest(&self) -> Option<&TreeDigest> {
        self.output.as_ref().map(|s| &s.digest)
    }
}

/// Output of a single argv execution inside a sandbox.
#[derive(Debug)]
pub struct StepOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A scratch root for one chain of tool invocations.
pub struct Sandbox {
    dir: TempDir,
    store: Store,
}

impl Sandbox {
    pub fn create(store: &Store) -> Result<Self> {
        let dir = TempDir::new()
            .map_err(|e| KilnError::Sandbox(format!("failed to create sandbox: {e}")))?;
        Ok(Self {
            dir,
            store: store.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Materialize a snapshot into the sandbox root.
    pub fn materialize(&self, digest: &TreeDigest) -> Result<()> {
        self.store.materialize(digest, self.dir.path())
    }

    /// Write a file into the sandbox, creating parent directories.
    pub fn write_file(&self, relative: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)?;
        Ok(())
    }

    /// Create a directory inside the sandbox.
    pub fn create_dir(&self, relative: impl AsRef<Path>) -> Result<()> {
        std::fs::create_dir_all(self.dir.path().join(relative))?;
        Ok(())
    }

    /// Materialize a snapshot under a fixed mount path and strip write
    /// permission from every file, so no step in the chain can modify it.
    pub fn mount_immutable(&self, relative: impl AsRef<Path>, digest: &TreeDigest) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let root = self.dir.path().join(relative);
        self.store.materialize(digest, &root)?;
        for entry in walk_files(&root)? {
            let metadata = std::fs::metadata(&entry)?;
            let mode = metadata.permissions().mode() & !0o222;
            std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    /// Execute one argv with the sandbox root as working directory.
    ///
    /// The child environment is exactly `env` plus an inherited `PATH`
    /// (tools like gunzip resolve helpers through it). Stdin is closed.
    pub async fn exec(&self, argv: &[String], env: &BTreeMap<String, String>) -> Result<StepOutput> {
        if argv.is_empty() {
            return Err(KilnError::Sandbox("cannot execute an empty argv".to_string()));
        }

        tracing::debug!(argv = ?argv, sandbox = %self.dir.path().display(), "executing sandboxed process");

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(self.dir.path())
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !env.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                command.env("PATH", path);
            }
        }

        let output = command.output().await?;
        Ok(StepOutput {
            // A None exit status means the child died to a signal.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Capture declared outputs into a new snapshot.
    pub fn capture_outputs(&self, files: &[String], dirs: &[String]) -> Result<Snapshot> {
        let staging = TempDir::new()
            .map_err(|e| KilnError::Sandbox(format!("failed to create capture dir: {e}")))?;

        for dir in dirs {
            let source = self.dir.path().join(dir);
            if !source.is_dir() {
                return Err(KilnError::Sandbox(format!(
                    "declared output directory `{dir}` was not produced"
                )));
            }
            copy_tree(&source, &staging.path().join(dir))?;
        }
        for file in files {
            let source = self.dir.path().join(file);
            if !source.is_file() {
                return Err(KilnError::Sandbox(format!(
                    "declared output file `{file}` was not produced"
                )));
            }
            let dest = staging.path().join(file);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&source, &dest)?;
        }

        self.store.capture(staging.path())
    }
}

fn walk_files(root: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = std::fs::symlink_metadata(&path)?;
        if metadata.file_type().is_symlink() {
            continue;
        }
        if metadata.is_dir() {
            files.extend(walk_files(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
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
            std::fs::set_permissions(&to, metadata.permissions())?;
        }
    }
    Ok(())
}

/// Runs process descriptions in fresh sandboxes.
#[derive(Debug, Clone)]
pub struct Executor {
    store: Store,
}

impl Executor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Run a single process.
    pub async fn run(&self, process: &Process) -> Result<ExecutionResult> {
        self.run_fused(&FusedProcess::new(vec![process.clone()])).await
    }

    /// Run a fused chain: one sandbox, each argv in order, abort on the
    /// first non-zero exit. Declared outputs are captured only when every
    /// step succeeded.
    pub async fn run_fused(&self, fused: &FusedProcess) -> Result<ExecutionResult> {
        let sandbox = Sandbox::create(&self.store)?;

        let inputs = fused.input_digests();
        if !inputs.is_empty() {
            let merged = self.store.merge(&inputs)?;
            sandbox.materialize(&merged.digest)?;
        }
        for (path, digest) in fused.merged_immutable_inputs() {
            sandbox.mount_immutable(&path, &digest)?;
        }

        let env = fused.merged_env();
        let mut stdout = String::new();
        let mut stderr = String::new();

        for process in &fused.processes {
            let step = sandbox.exec(&process.argv, &env).await?;
            stdout.push_str(&step.stdout);
            stderr.push_str(&step.stderr);

            if !step.success() {
                tracing::debug!(
                    description = %process.description,
                    exit_code = step.exit_code,
                    "fused chain aborted"
                );
                return Ok(ExecutionResult {
                    exit_code: step.exit_code,
                    stdout,
                    stderr,
                    output: None,
                });
            }
        }

        let output = sandbox.capture_outputs(&fused.output_files(), &fused.output_dirs())?;
        Ok(ExecutionResult {
            exit_code: 0,
            stdout,
            stderr,
            output: Some(output),
        })
    }
}
