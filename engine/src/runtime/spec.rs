//! Typed patching of the OCI runtime `config.json`.
//!
//! umoci's unpack emits a config aimed at interactive use; before runc can
//! execute a build command the config is rewritten in a fixed sequence of
//! transforms. Each transform touches its own keys, so the sequence is
//! cumulative. Every struct carries a flattened `extra` map: keys kiln does
//! not model pass through serialization untouched.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kiln_core::config::{IdMapping, SandboxOptions};
use kiln_core::error::Result;

/// Capabilities granted to sandboxed container processes.
///
/// A deliberately reduced allow-list appropriate for rootless execution;
/// raw and admin-level capabilities are excluded.
pub const SANDBOX_CAPABILITIES: [&str; 14] = [
    "CAP_AUDIT_WRITE",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_MKNOD",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_RAW",
    "CAP_SETFCAP",
    "CAP_SETGID",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_CHROOT",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessSpec>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<LinuxSpec>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Capabilities>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub effective: Vec<String>,
    #[serde(default)]
    pub inheritable: Vec<String>,
    #[serde(default)]
    pub permitted: Vec<String>,
    #[serde(default)]
    pub bounding: Vec<String>,
    #[serde(default)]
    pub ambient: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub mount_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Mount {
    fn bind(destination: &str, source: &str, options: &[&str]) -> Self {
        Self {
            destination: destination.to_string(),
            mount_type: Some("bind".to_string()),
            source: Some(source.to_string()),
            options: options.iter().map(|s| s.to_string()).collect(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinuxSpec {
    #[serde(
        default,
        rename = "uidMappings",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub uid_mappings: Vec<SpecIdMapping>,
    #[serde(
        default,
        rename = "gidMappings",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub gid_mappings: Vec<SpecIdMapping>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An ID mapping in runtime-spec JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecIdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

impl From<&IdMapping> for SpecIdMapping {
    fn from(mapping: &IdMapping) -> Self {
        Self {
            container_id: mapping.container_id,
            host_id: mapping.host_id,
            size: mapping.size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// The command a container run executes.
///
/// An `Argv` is a real argument vector: each element is quoted into the
/// single word the shell receives. A `ShellLine` is a pre-formed shell
/// command line handed to the shell verbatim, operators and all - quoting
/// it would turn the whole line into one program name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommand {
    Argv(Vec<String>),
    ShellLine(String),
}

impl std::fmt::Display for RunCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunCommand::Argv(argv) => write!(f, "{}", shell_join(argv)),
            RunCommand::ShellLine(line) => write!(f, "{line}"),
        }
    }
}

impl From<Vec<String>> for RunCommand {
    fn from(argv: Vec<String>) -> Self {
        RunCommand::Argv(argv)
    }
}

impl From<String> for RunCommand {
    fn from(line: String) -> Self {
        RunCommand::ShellLine(line)
    }
}

impl From<&str> for RunCommand {
    fn from(line: &str) -> Self {
        RunCommand::ShellLine(line.to_string())
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn process_mut(&mut self) -> &mut ProcessSpec {
        self.process.get_or_insert_with(ProcessSpec::default)
    }

    fn linux_mut(&mut self) -> &mut LinuxSpec {
        self.linux.get_or_insert_with(LinuxSpec::default)
    }

    /// 1. Set `process.args` to the wrapped shell invocation of the command:
    /// an argv is quoted word by word, a shell line passes through verbatim.
    pub fn set_process_args(&mut self, shell: &[String], command: &RunCommand) {
        let mut args: Vec<String> = shell.to_vec();
        args.push(command.to_string());
        self.process_mut().args = args;
    }

    /// 2. Force `process.terminal = false` unless interactive execution was
    /// explicitly requested.
    pub fn set_terminal(&mut self, interactive: bool) {
        self.process_mut().terminal = Some(interactive);
    }

    /// 3. Install the fixed sandbox capability allow-list on all five sets.
    pub fn apply_sandbox_capabilities(&mut self) {
        let caps: Vec<String> = SANDBOX_CAPABILITIES.iter().map(|s| s.to_string()).collect();
        let process = self.process_mut();
        let capabilities = process.capabilities.get_or_insert_with(Capabilities::default);
        capabilities.effective = caps.clone();
        capabilities.inheritable = caps.clone();
        capabilities.permitted = caps.clone();
        capabilities.bounding = caps.clone();
        capabilities.ambient = caps;
    }

    /// 4. Inject the configured UID/GID mapping lists and run as mapped root.
    pub fn set_id_mappings(&mut self, uid_map: &[IdMapping], gid_map: &[IdMapping]) {
        let linux = self.linux_mut();
        linux.uid_mappings = uid_map.iter().map(SpecIdMapping::from).collect();
        linux.gid_mappings = gid_map.iter().map(SpecIdMapping::from).collect();

        let process = self.process_mut();
        let user = process.user.get_or_insert_with(User::default);
        user.uid = 0;
        user.gid = 0;
    }

    /// 5. Add the runtime bind-mounts: `/etc/resolv.conf` always, `/sys`
    /// only in non-rootless mode, and a tmpfs at `/run`. The first mount's
    /// options are normalized for unprivileged mounting.
    pub fn add_runtime_mounts(&mut self, rootless: bool) {
        if let Some(first) = self.mounts.first_mut() {
            first.options = vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
            ];
        }

        self.mounts.push(Mount::bind(
            "/etc/resolv.conf",
            "/etc/resolv.conf",
            &["ro", "rbind", "rprivate", "nosuid", "noexec", "nodev"],
        ));
        if !rootless {
            self.mounts.push(Mount::bind(
                "/sys",
                "/sys",
                &["rprivate", "nosuid", "noexec", "nodev", "ro", "rbind"],
            ));
        }
        self.mounts.push(Mount {
            destination: "/run".to_string(),
            mount_type: Some("tmpfs".to_string()),
            source: Some("tmpfs".to_string()),
            options: ["noexec", "nosuid", "nodev", "rprivate"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra: serde_json::Map::new(),
        });
    }

    /// 6. In non-rootless mode, drop the network and user namespaces.
    pub fn strip_isolated_namespaces(&mut self) {
        self.linux_mut()
            .namespaces
            .retain(|ns| ns.ns_type != "network" && ns.ns_type != "user");
    }

    /// Apply the full patch sequence for running a command, in the fixed
    /// order the transforms are specified in.
    pub fn patch_for_run(
        &mut self,
        options: &SandboxOptions,
        command: &RunCommand,
        interactive: bool,
    ) {
        self.set_process_args(&options.command_shell, command);
        self.set_terminal(interactive);
        self.apply_sandbox_capabilities();
        self.set_id_mappings(&options.uid_map, &options.gid_map);
        self.add_runtime_mounts(options.rootless);
        if !options.rootless {
            self.strip_isolated_namespaces();
        }
    }
}

/// Join an argv into a single shell word sequence, quoting anything the
/// shell would otherwise split or expand.
fn shell_join(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
