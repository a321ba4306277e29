//! Polymorphic image bundle construction.
//!
//! Builders are registered variants; a target is claimed through
//! `is_applicable` on its populated field groups. Exactly one builder must
//! claim any given target - zero or several is a hard error naming the
//! candidates, because silently picking one would make the build depend on
//! registration order.

use async_trait::async_trait;

use kiln_core::error::{KilnError, Result};

use crate::image::FallibleImageBundle;
use crate::layer::ImageLayer;
use crate::process::{FusedProcess, Process};
use crate::sandbox::{ExecutionResult, Executor};
use crate::store::TreeDigest;
use crate::target::{Address, BuildContext, ImageTarget};

mod build;
mod empty;
mod pull;
mod python;

pub use build::BuildImageBuilder;
pub use empty::EmptyImageBuilder;
pub use pull::PullImageBuilder;
pub use python::PythonImageBuilder;

/// One image bundle construction strategy.
#[async_trait]
pub trait BundleBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this builder claims the target.
    fn is_applicable(&self, target: &ImageTarget) -> bool;

    /// Build the bundle. Tool failures are returned as data inside the
    /// `FallibleImageBundle`; only unexpected conditions are errors.
    async fn build(
        &self,
        ctx: &BuildContext,
        registry: &BuilderRegistry,
        target: &ImageTarget,
    ) -> Result<FallibleImageBundle>;
}

impl std::fmt::Debug for dyn BundleBuilder + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Registry of builder variants with exactly-one-applicable dispatch.
pub struct BuilderRegistry {
    builders: Vec<Box<dyn BundleBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self {
            builders: Vec::new(),
        }
    }

    /// Registry with every built-in variant.
    pub fn with_default_builders() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(EmptyImageBuilder));
        registry.register(Box::new(PullImageBuilder));
        registry.register(Box::new(BuildImageBuilder));
        registry.register(Box::new(PythonImageBuilder));
        registry
    }

    pub fn register(&mut self, builder: Box<dyn BundleBuilder>) {
        self.builders.push(builder);
    }

    /// Resolve the single applicable builder for a target.
    pub fn resolve(&self, target: &ImageTarget) -> Result<&dyn BundleBuilder> {
        let applicable: Vec<&dyn BundleBuilder> = self
            .builders
            .iter()
            .filter(|b| b.is_applicable(target))
            .map(|b| b.as_ref())
            .collect();

        match applicable.as_slice() {
            [] => Err(KilnError::NoBuilder {
                address: target.address.to_string(),
            }),
            [single] => Ok(*single),
            several => {
                let mut candidates: Vec<String> =
                    several.iter().map(|b| b.name().to_string()).collect();
                candidates.sort();
                Err(KilnError::AmbiguousBuilder {
                    address: target.address.to_string(),
                    candidates,
                })
            }
        }
    }

    /// Build the bundle for a registered target address.
    pub async fn build_address(
        &self,
        ctx: &BuildContext,
        address: &Address,
    ) -> Result<FallibleImageBundle> {
        let target = ctx.target(address)?.clone();
        self.build_target(ctx, &target).await
    }

    /// Build the bundle for a target.
    pub async fn build_target(
        &self,
        ctx: &BuildContext,
        target: &ImageTarget,
    ) -> Result<FallibleImageBundle> {
        let builder = self.resolve(target)?;
        tracing::debug!(address = %target.address, builder = builder.name(), "building image bundle");
        builder.build(ctx, self, target).await
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::with_default_builders()
    }
}

/// Apply one assembled layer to the current bundle digest.
///
/// Runs the optional decompression, the add-layer and the config step as
/// one fused chain; each step mutates the on-disk `build/` store the next
/// step reads, so the chain is inherently sequential. Returns the
/// execution result whose output (on success) is the new current digest.
pub(crate) async fn apply_layer(
    ctx: &BuildContext,
    current: &TreeDigest,
    layer: &ImageLayer,
) -> Result<ExecutionResult> {
    let umoci = ctx.toolchain.umoci.to_string_lossy().into_owned();
    let input = ctx.store.merge(&[current, &layer.tar_digest])?;

    let mut steps = Vec::new();
    if let Some(argv) = layer.decompress_command() {
        steps.push(Process::new(
            argv,
            format!("Decompressing image layer: {}", layer.address),
        ));
    }

    let mut add_argv = vec![umoci.clone()];
    add_argv.extend(layer.layer_command.iter().cloned());
    steps.push(
        Process::new(add_argv, format!("Applying image layer: {}", layer.address))
            .with_input(input.digest),
    );

    let mut config_argv = vec![umoci];
    config_argv.extend(layer.config_command.iter().cloned());
    steps.push(
        Process::new(
            config_argv,
            format!("Configuring image layer: {}", layer.address),
        )
        .with_output_dir("build"),
    );

    Executor::new(ctx.store.clone())
        .run_fused(&FusedProcess::new(steps))
        .await
}
