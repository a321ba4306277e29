//! Kiln engine - OCI image bundle assembly and sandboxed execution.
//!
//! Builds container images from layered build artifacts by driving external
//! `umoci`, `runc` and `skopeo` binaries, unpacks images into OCI runtime
//! bundles, patches runtime configuration for rootless execution, runs
//! commands inside bundles and repacks the results. Everything operates on
//! content-addressed snapshots so identical inputs always produce identical
//! digests.

pub mod archive;
pub mod builder;
pub mod copy;
pub mod image;
pub mod layer;
pub mod process;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod target;

// Re-export the surface most callers need
pub use archive::ArchiveOptions;
pub use builder::{BuilderRegistry, BundleBuilder};
pub use copy::{copy_from_container, CopyFromRequest};
pub use image::{extract_image_sha, BuildPhase, FallibleImageBundle, ImageBundle};
pub use layer::{assemble_layer, BuiltArtifact, ImageLayer};
pub use process::{FusedProcess, Process};
pub use runtime::{ContainerRunResult, ContainerRunner, RunCommand, RunContainerRequest, RuntimeConfig};
pub use sandbox::{ExecutionResult, Executor, Sandbox};
pub use store::{Snapshot, Store, TreeDigest};
pub use target::{Address, BuildContext, ImageTarget};
