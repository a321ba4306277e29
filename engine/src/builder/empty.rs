//! The canonical empty base image.
//!
//! Built by fusing `umoci init`, `umoci new` and a config pass that erases
//! timestamps and history. With everything pinned to the epoch the
//! resulting manifest digest is a constant of the configured metadata:
//! building the empty base twice always yields the same image sha.

use async_trait::async_trait;

use kiln_core::config::FIXED_CREATED;
use kiln_core::error::Result;

use crate::builder::{BuilderRegistry, BundleBuilder};
use crate::image::{extract_image_sha, BuildPhase, FallibleImageBundle, ImageBundle};
use crate::process::{FusedProcess, Process};
use crate::sandbox::Executor;
use crate::target::{BuildContext, ImageTarget};

pub struct EmptyImageBuilder;

#[async_trait]
impl BundleBuilder for EmptyImageBuilder {
    fn name(&self) -> &'static str {
        "empty"
    }

    fn is_applicable(&self, target: &ImageTarget) -> bool {
        target.empty
    }

    async fn build(
        &self,
        ctx: &BuildContext,
        _registry: &BuilderRegistry,
        target: &ImageTarget,
    ) -> Result<FallibleImageBundle> {
        let umoci = ctx.toolchain.umoci.to_string_lossy().into_owned();

        let fused = FusedProcess::new(vec![
            Process::new(
                vec![
                    umoci.clone(),
                    "init".to_string(),
                    "--layout".to_string(),
                    "build".to_string(),
                ],
                "Creating base OCI layout",
            ),
            Process::new(
                vec![
                    umoci.clone(),
                    "new".to_string(),
                    "--image".to_string(),
                    "build:build".to_string(),
                ],
                "Creating a new empty base image",
            ),
            Process::new(
                vec![
                    umoci,
                    "config".to_string(),
                    "--image".to_string(),
                    "build:build".to_string(),
                    "--config.env".to_string(),
                    format!("BUILT_BY={}", ctx.options.built_by),
                    format!("--author={}", ctx.options.author),
                    format!("--created={FIXED_CREATED}"),
                    "--no-history".to_string(),
                ],
                "Erasing timestamps and image history",
            )
            .with_output_dir("build"),
        ]);

        let result = Executor::new(ctx.store.clone()).run_fused(&fused).await?;
        if !result.success() {
            return Ok(FallibleImageBundle::tool_failure(
                &result,
                BuildPhase::Configuring,
            ));
        }

        let digest = result
            .output
            .expect("successful execution captures outputs")
            .digest;
        let image_sha = extract_image_sha(&ctx.store, &digest)?;
        tracing::debug!(address = %target.address, image_sha = %image_sha, "built empty base image");

        Ok(FallibleImageBundle::success(ImageBundle {
            digest,
            image_sha,
            is_local: true,
        }))
    }
}
