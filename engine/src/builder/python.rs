//! Python-specialized image builds.
//!
//! Like the generic layered build, but the entrypoint is inferred from the
//! packaged artifacts when the target does not name one: the first layer
//! whose config declares a `.pex` entrypoint wins, and the final image runs
//! it through the interpreter. Pre-built compressed layers get a gunzip
//! step before add-layer, since the raw add-layer step only accepts
//! uncompressed input.

use async_trait::async_trait;

use kiln_core::config::FIXED_CREATED;
use kiln_core::error::Result;

use crate::builder::{apply_layer, BuilderRegistry, BundleBuilder};
use crate::image::{extract_image_sha, BuildPhase, FallibleImageBundle, ImageBundle};
use crate::layer::assemble_layer;
use crate::process::Process;
use crate::sandbox::Executor;
use crate::target::{BuildContext, ImageTarget};

pub struct PythonImageBuilder;

#[async_trait]
impl BundleBuilder for PythonImageBuilder {
    fn name(&self) -> &'static str {
        "python"
    }

    fn is_applicable(&self, target: &ImageTarget) -> bool {
        target.python
    }

    async fn build(
        &self,
        ctx: &BuildContext,
        registry: &BuilderRegistry,
        target: &ImageTarget,
    ) -> Result<FallibleImageBundle> {
        let base_address = target.base.as_ref().expect("python targets declare a base");
        let base = registry.build_address(ctx, base_address).await?;
        let Some(base_bundle) = &base.output else {
            return Ok(base.dependency_failure());
        };

        let mut current = base_bundle.digest.clone();
        let mut main = target.main.clone();

        for dependency in &target.dependencies {
            let artifacts = ctx.artifacts(dependency);
            let layer = assemble_layer(&ctx.store, &ctx.options, dependency, artifacts)?;

            // Infer the entrypoint from the first packaged .pex artifact.
            if main.is_none() {
                if let Some(entrypoint) = layer.declared_entrypoint() {
                    if entrypoint.ends_with(".pex") {
                        main = Some(entrypoint.to_string());
                    }
                }
            }

            let result = apply_layer(ctx, &current, &layer).await?;
            if !result.success() {
                return Ok(FallibleImageBundle::tool_failure(
                    &result,
                    BuildPhase::Layering,
                ));
            }
            current = result
                .output
                .expect("successful execution captures outputs")
                .digest;
        }

        if let Some(main) = &main {
            let argv = vec![
                ctx.toolchain.umoci.to_string_lossy().into_owned(),
                "config".to_string(),
                "--image".to_string(),
                "build:build".to_string(),
                "--config.entrypoint".to_string(),
                "python".to_string(),
                "--config.entrypoint".to_string(),
                main.clone(),
                format!("--history.created={FIXED_CREATED}"),
            ];
            let process = Process::new(
                argv,
                format!("Setting python entrypoint: {}", target.address),
            )
            .with_input(current.clone())
            .with_output_dir("build");

            let result = Executor::new(ctx.store.clone()).run(&process).await?;
            if !result.success() {
                return Ok(FallibleImageBundle::tool_failure(
                    &result,
                    BuildPhase::Configuring,
                ));
            }
            current = result
                .output
                .expect("successful execution captures outputs")
                .digest;
        }

        let image_sha = extract_image_sha(&ctx.store, &current)?;
        Ok(FallibleImageBundle::success(ImageBundle {
            digest: current,
            image_sha,
            is_local: true,
        }))
    }
}
