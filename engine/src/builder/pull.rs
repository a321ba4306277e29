//! Pulling an image bundle from a registry by digest.
//!
//! Registry traffic is delegated entirely to the copy tool; the engine
//! only assembles the invocation and wraps the fetched layout. Pulled
//! bundles keep the digest they were requested by, so no local digest
//! extraction happens here.

use async_trait::async_trait;

use kiln_core::error::Result;

use crate::builder::{BuilderRegistry, BundleBuilder};
use crate::image::{BuildPhase, FallibleImageBundle, ImageBundle};
use crate::process::Process;
use crate::sandbox::Executor;
use crate::target::{BuildContext, ImageTarget};

pub struct PullImageBuilder;

#[async_trait]
impl BundleBuilder for PullImageBuilder {
    fn name(&self) -> &'static str {
        "pull"
    }

    fn is_applicable(&self, target: &ImageTarget) -> bool {
        target.repository.is_some() && target.pull_digest.is_some()
    }

    async fn build(
        &self,
        ctx: &BuildContext,
        _registry: &BuilderRegistry,
        target: &ImageTarget,
    ) -> Result<FallibleImageBundle> {
        let process = pull_process(ctx, target);
        tracing::info!(address = %target.address, "pulling image bundle");

        let result = Executor::new(ctx.store.clone()).run(&process).await?;
        if !result.success() {
            return Ok(FallibleImageBundle::tool_failure(
                &result,
                BuildPhase::Pulling,
            ));
        }

        let digest = result
            .output
            .expect("successful execution captures outputs")
            .digest;
        let image_sha = format!(
            "sha256:{}",
            target.pull_digest.as_deref().expect("checked by is_applicable")
        );

        Ok(FallibleImageBundle::success(ImageBundle {
            digest,
            image_sha,
            is_local: false,
        }))
    }
}

fn pull_process(ctx: &BuildContext, target: &ImageTarget) -> Process {
    let repository = target.repository.as_deref().expect("checked by is_applicable");
    let digest = target.pull_digest.as_deref().expect("checked by is_applicable");

    let mut argv = vec![
        ctx.toolchain.skopeo.to_string_lossy().into_owned(),
        "--insecure-policy".to_string(),
    ];
    if let Some(os) = &target.os {
        argv.push("--override-os".to_string());
        argv.push(os.clone());
    }
    if let Some(arch) = &target.arch {
        argv.push("--override-arch".to_string());
        argv.push(arch.clone());
    }
    argv.push("copy".to_string());
    if target.anonymous {
        argv.push("--src-no-creds".to_string());
    }
    argv.push(format!("docker://{repository}@sha256:{digest}"));
    argv.push("oci:build:build".to_string());

    Process::new(
        argv,
        format!("Download OCI image {repository}@sha256:{digest}"),
    )
    .with_output_dir("build")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::config::{SandboxOptions, Toolchain};
    use crate::store::Store;

    fn test_ctx() -> (tempfile::TempDir, BuildContext) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("store")).unwrap();
        let ctx = BuildContext::new(
            store,
            SandboxOptions::default(),
            Toolchain::with_paths("/opt/bin/umoci", "/opt/bin/runc", "/opt/bin/skopeo"),
        );
        (tmp, ctx)
    }

    #[test]
    fn test_pull_argv_shape() {
        let (_tmp, ctx) = test_ctx();
        let digest = "d".repeat(64);
        let target = ImageTarget::pull("images/alpine", "docker.io/library/alpine", &digest);

        let process = pull_process(&ctx, &target);
        assert_eq!(process.argv[0], "/opt/bin/skopeo");
        assert_eq!(process.argv[1], "--insecure-policy");
        assert_eq!(process.argv[2], "copy");
        assert_eq!(
            process.argv[3],
            format!("docker://docker.io/library/alpine@sha256:{digest}")
        );
        assert_eq!(process.argv[4], "oci:build:build");
        assert_eq!(process.output_dirs, vec!["build"]);
    }

    #[test]
    fn test_anonymous_pull_adds_no_creds() {
        let (_tmp, ctx) = test_ctx();
        let mut target = ImageTarget::pull("images/alpine", "docker.io/library/alpine", "ab12");
        target.anonymous = true;

        let process = pull_process(&ctx, &target);
        let copy_index = process.argv.iter().position(|a| a == "copy").unwrap();
        assert_eq!(process.argv[copy_index + 1], "--src-no-creds");
    }

    #[test]
    fn test_platform_overrides() {
        let (_tmp, ctx) = test_ctx();
        let mut target = ImageTarget::pull("images/alpine", "docker.io/library/alpine", "ab12");
        target.os = Some("linux".to_string());
        target.arch = Some("arm64".to_string());

        let process = pull_process(&ctx, &target);
        let argv = &process.argv;
        let os_index = argv.iter().position(|a| a == "--override-os").unwrap();
        assert_eq!(argv[os_index + 1], "linux");
        let arch_index = argv.iter().position(|a| a == "--override-arch").unwrap();
        assert_eq!(argv[arch_index + 1], "arm64");
        // Overrides are global flags: they come before the copy subcommand.
        let copy_index = argv.iter().position(|a| a == "copy").unwrap();
        assert!(os_index < copy_index && arch_index < copy_index);
    }
}
