//! Process descriptions and process fusion.
//!
//! A `Process` describes one external tool invocation: argv, environment,
//! an input snapshot and the outputs it is expected to produce. The engine
//! composes these descriptions; execution happens in `sandbox`.
//!
//! `FusedProcess` merges an ordered chain of processes into a single
//! sandboxed execution. Materializing a sandbox is the dominant cost of a
//! container-heavy build, so collapsing N invocations into one sandbox
//! round trip is what fusion exists for. The chain aborts on the first
//! non-zero exit; later steps never run.

use std::collections::BTreeMap;

use crate::store::TreeDigest;

/// Description of one external tool invocation.
#[derive(Debug, Clone)]
pub struct Process {
    pub argv: Vec<String>,
    pub description: String,
    pub env: BTreeMap<String, String>,
    /// Snapshot materialized into the sandbox before execution
    pub input: Option<TreeDigest>,
    /// Read-only trees mounted at fixed sandbox-relative paths, e.g.
    /// helper tool distributions the chain must not modify
    pub immutable_inputs: BTreeMap<String, TreeDigest>,
    /// Files the invocation is expected to produce, sandbox-relative
    pub output_files: Vec<String>,
    /// Directories the invocation is expected to produce, sandbox-relative
    pub output_dirs: Vec<String>,
}

impl Process {
    pub fn new(argv: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            argv,
            description: description.into(),
            env: BTreeMap::new(),
            input: None,
            immutable_inputs: BTreeMap::new(),
            output_files: Vec::new(),
            output_dirs: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, input: TreeDigest) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_immutable_input(mut self, path: impl Into<String>, digest: TreeDigest) -> Self {
        self.immutable_inputs.insert(path.into(), digest);
        self
    }

    pub fn with_output_file(mut self, path: impl Into<String>) -> Self {
        self.output_files.push(path.into());
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<String>) -> Self {
        self.output_dirs.push(path.into());
        self
    }
}

/// An ordered chain of processes executed in one sandbox.
#[derive(Debug, Clone)]
pub struct FusedProcess {
    pub processes: Vec<Process>,
}

impl FusedProcess {
    pub fn new(processes: Vec<Process>) -> Self {
        Self { processes }
    }

    /// Joined description of every step.
    pub fn description(&self) -> String {
        self.processes
            .iter()
            .map(|p| p.description.as_str())
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Union of input digests, first occurrence wins on duplicates.
    pub fn input_digests(&self) -> Vec<&TreeDigest> {
        let mut digests: Vec<&TreeDigest> = Vec::new();
        for process in &self.processes {
            if let Some(input) = &process.input {
                if !digests.contains(&input) {
                    digests.push(input);
                }
            }
        }
        digests
    }

    /// Merged environment; a later process wins on key collision.
    pub fn merged_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for process in &self.processes {
            for (key, value) in &process.env {
                env.insert(key.clone(), value.clone());
            }
        }
        env
    }

    /// Merged immutable input mounts; a later process wins when two steps
    /// claim the same mount path.
    pub fn merged_immutable_inputs(&self) -> BTreeMap<String, TreeDigest> {
        let mut mounts = BTreeMap::new();
        for process in &self.processes {
            for (path, digest) in &process.immutable_inputs {
                mounts.insert(path.clone(), digest.clone());
            }
        }
        mounts
    }

    /// Union of declared output files, in declaration order.
    pub fn output_files(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        for process in &self.processes {
            for path in &process.output_files {
                if !outputs.contains(path) {
                    outputs.push(path.clone());
                }
            }
        }
        outputs
    }

    /// Union of declared output directories, in declaration order.
    pub fn output_dirs(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        for process in &self.processes {
            for path in &process.output_dirs {
                if !outputs.contains(path) {
                    outputs.push(path.clone());
                }
            }
        }
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fused_description_joins_steps() {
        let fused = FusedProcess::new(vec![
            Process::new(argv(&["a"]), "first"),
            Process::new(argv(&["b"]), "second"),
        ]);
        assert_eq!(fused.description(), "first | second");
    }

    #[test]
    fn test_merged_env_later_wins() {
        let fused = FusedProcess::new(vec![
            Process::new(argv(&["a"]), "a")
                .with_env("SHARED", "one")
                .with_env("ONLY_A", "a"),
            Process::new(argv(&["b"]), "b").with_env("SHARED", "two"),
        ]);
        let env = fused.merged_env();
        assert_eq!(env.get("SHARED").unwrap(), "two");
        assert_eq!(env.get("ONLY_A").unwrap(), "a");
    }

    #[test]
    fn test_outputs_are_deduplicated_union() {
        let fused = FusedProcess::new(vec![
            Process::new(argv(&["a"]), "a")
                .with_output_dir("build")
                .with_output_file("log.txt"),
            Process::new(argv(&["b"]), "b")
                .with_output_dir("build")
                .with_output_dir("dist"),
        ]);
        assert_eq!(fused.output_dirs(), vec!["build", "dist"]);
        assert_eq!(fused.output_files(), vec!["log.txt"]);
    }

    #[test]
    fn test_merged_immutable_inputs_later_wins() {
        let first = crate::store::TreeDigest::from_hex("1".repeat(64)).unwrap();
        let second = crate::store::TreeDigest::from_hex("2".repeat(64)).unwrap();
        let fused = FusedProcess::new(vec![
            Process::new(argv(&["a"]), "a")
                .with_immutable_input("tools/umoci", first.clone())
                .with_immutable_input("tools/jq", first.clone()),
            Process::new(argv(&["b"]), "b").with_immutable_input("tools/umoci", second.clone()),
        ]);
        let mounts = fused.merged_immutable_inputs();
        assert_eq!(mounts.get("tools/umoci"), Some(&second));
        assert_eq!(mounts.get("tools/jq"), Some(&first));
    }

    #[test]
    fn test_input_digests_deduplicated() {
        let digest = crate::store::TreeDigest::from_hex("a".repeat(64)).unwrap();
        let fused = FusedProcess::new(vec![
            Process::new(argv(&["a"]), "a").with_input(digest.clone()),
            Process::new(argv(&["b"]), "b").with_input(digest.clone()),
        ]);
        assert_eq!(fused.input_digests().len(), 1);
    }
}
