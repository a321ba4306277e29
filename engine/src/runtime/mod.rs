//! Runtime bundle handling: unpack, config patching, execution, repack.

pub mod runner;
pub mod spec;
pub mod unpack;

pub use runner::{container_name, ContainerRunResult, ContainerRunner, RunContainerRequest};
pub use spec::{RunCommand, RuntimeConfig};
pub use unpack::{repack_process, unpack_process};
