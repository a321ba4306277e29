//! Unpack and repack process construction.
//!
//! Unpacking turns an image bundle into an OCI runtime bundle
//! (`unpacked_image/{config.json, rootfs/}`); repacking wraps a modified
//! bundle back into the image layout as a new layer with provenance
//! metadata describing what produced it.

use kiln_core::config::{SandboxOptions, Toolchain, FIXED_CREATED};

use crate::process::Process;
use crate::store::TreeDigest;

/// Directory the runtime bundle is unpacked into, sandbox-relative.
pub const UNPACKED_DIR: &str = "unpacked_image";

/// Build the `umoci unpack` process for a bundle digest.
///
/// Honors the rootless flag and injects the configured UID/GID mapping
/// triples in order.
pub fn unpack_process(
    toolchain: &Toolchain,
    options: &SandboxOptions,
    bundle: TreeDigest,
) -> Process {
    let mut argv = vec![
        toolchain.umoci.to_string_lossy().into_owned(),
        "unpack".to_string(),
    ];
    if options.rootless {
        argv.push("--rootless".to_string());
    }
    for mapping in &options.uid_map {
        argv.push("--uid-map".to_string());
        argv.push(mapping.as_flag());
    }
    for mapping in &options.gid_map {
        argv.push("--gid-map".to_string());
        argv.push(mapping.as_flag());
    }
    argv.extend([
        "--image".to_string(),
        "build:build".to_string(),
        UNPACKED_DIR.to_string(),
    ]);

    Process::new(argv, "Unpacking OCI bundle")
        .with_input(bundle)
        .with_output_dir(UNPACKED_DIR)
}

/// Build the `umoci repack` process for a modified runtime bundle.
///
/// The new layer's history records who produced it and the command that
/// ran, with the fixed creation timestamp keeping the result reproducible.
pub fn repack_process(toolchain: &Toolchain, options: &SandboxOptions, command: &str) -> Process {
    let argv = vec![
        toolchain.umoci.to_string_lossy().into_owned(),
        "repack".to_string(),
        format!("--history.author={}", options.author),
        format!("--history.created={FIXED_CREATED}"),
        "--history.comment=Filesystem changes from a sandboxed run".to_string(),
        format!("--history.created_by=run: {command}"),
        "--image".to_string(),
        "build:build".to_string(),
        UNPACKED_DIR.to_string(),
    ];

    Process::new(argv, format!("Repacking OCI bundle after: {command}")).with_output_dir("build")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kiln_core::config::IdMapping;

    use crate::builder::BuilderRegistry;
    use crate::layer::BuiltArtifact;
    use crate::sandbox::Sandbox;
    use crate::store::Store;
    use crate::target::{Address, BuildContext, ImageTarget};

    fn toolchain() -> Toolchain {
        Toolchain::with_paths("/opt/bin/umoci", "/opt/bin/runc", "/opt/bin/skopeo")
    }

    fn digest() -> TreeDigest {
        TreeDigest::from_hex("c".repeat(64)).unwrap()
    }

    #[test]
    fn test_unpack_rootless_with_mappings() {
        let options = SandboxOptions {
            uid_map: vec![IdMapping::new(0, 1000, 1), IdMapping::new(1, 100000, 999)],
            gid_map: vec![IdMapping::new(0, 1000, 1)],
            ..SandboxOptions::default()
        };
        let process = unpack_process(&toolchain(), &options, digest());

        assert_eq!(process.argv[0], "/opt/bin/umoci");
        assert_eq!(process.argv[1], "unpack");
        assert!(process.argv.contains(&"--rootless".to_string()));

        // Mapping flags preserve declaration order
        let uid_positions: Vec<usize> = process
            .argv
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--uid-map")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(uid_positions.len(), 2);
        assert_eq!(process.argv[uid_positions[0] + 1], "0:1000:1");
        assert_eq!(process.argv[uid_positions[1] + 1], "1:100000:999");

        assert_eq!(process.argv.last().unwrap(), UNPACKED_DIR);
        assert_eq!(process.output_dirs, vec![UNPACKED_DIR]);
    }

    #[test]
    fn test_unpack_non_rootless_omits_flag() {
        let options = SandboxOptions {
            rootless: false,
            ..SandboxOptions::default()
        };
        let process = unpack_process(&toolchain(), &options, digest());
        assert!(!process.argv.contains(&"--rootless".to_string()));
    }

    // Drives real umoci; skipped when the toolchain is absent or the
    // environment cannot unpack.
    #[tokio::test]
    async fn test_unpack_then_repack_preserves_rootfs() {
        let Ok(toolchain) = Toolchain::discover() else {
            return;
        };
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("store")).unwrap();
        let options = SandboxOptions::default();

        let mut ctx = BuildContext::new(store.clone(), options.clone(), toolchain.clone());
        ctx.register_target(ImageTarget::empty("images/base"));
        ctx.register_target(
            ImageTarget::build("images/app", "images/base")
                .with_dependencies(vec![Address::new("pkgs/data")]),
        );
        let tree = store
            .snapshot_from_files(&[("etc/greeting.txt", b"hello" as &[u8])])
            .unwrap();
        ctx.register_artifacts(
            "pkgs/data",
            vec![BuiltArtifact::tree("etc/greeting.txt", tree.digest)],
        );

        let registry = BuilderRegistry::with_default_builders();
        let built = registry
            .build_address(&ctx, &Address::new("images/app"))
            .await
            .unwrap();
        let Some(bundle) = built.output else {
            eprintln!("skipping: image build unavailable here: {}", built.message());
            return;
        };

        let env = BTreeMap::new();

        let sandbox = Sandbox::create(&store).unwrap();
        sandbox.materialize(&bundle.digest).unwrap();
        let unpack = unpack_process(&toolchain, &options, bundle.digest.clone());
        let step = sandbox.exec(&unpack.argv, &env).await.unwrap();
        if !step.success() {
            eprintln!("skipping: unpack unavailable here: {}", step.stderr);
            return;
        }
        let rootfs_before = store
            .capture(&sandbox.path().join(UNPACKED_DIR).join("rootfs"))
            .unwrap();
        assert!(rootfs_before.entry("etc/greeting.txt").is_some());

        // Repack without modifying anything.
        let repack = repack_process(&toolchain, &options, "no-op");
        let step = sandbox.exec(&repack.argv, &env).await.unwrap();
        assert!(step.success(), "repack failed: {}", step.stderr);
        let repacked = sandbox.capture_outputs(&[], &["build".to_string()]).unwrap();

        // The repacked bundle unpacks to an identical rootfs.
        let second = Sandbox::create(&store).unwrap();
        second.materialize(&repacked.digest).unwrap();
        let unpack = unpack_process(&toolchain, &options, repacked.digest.clone());
        let step = second.exec(&unpack.argv, &env).await.unwrap();
        assert!(step.success(), "unpack of repacked bundle failed: {}", step.stderr);
        let rootfs_after = store
            .capture(&second.path().join(UNPACKED_DIR).join("rootfs"))
            .unwrap();

        assert_eq!(rootfs_before.digest, rootfs_after.digest);
    }

    #[test]
    fn test_repack_records_provenance() {
        let options = SandboxOptions::default();
        let process = repack_process(&toolchain(), &options, "make install");

        assert_eq!(process.argv[1], "repack");
        assert!(process
            .argv
            .contains(&"--history.author=kiln".to_string()));
        assert!(process
            .argv
            .contains(&"--history.created=1970-01-01T00:00:00Z".to_string()));
        assert!(process
            .argv
            .contains(&"--history.created_by=run: make install".to_string()));
        assert_eq!(process.output_dirs, vec!["build"]);
    }
}
