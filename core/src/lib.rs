//! Shared types for the kiln OCI build engine.
//!
//! Carries the error taxonomy and the explicit configuration structs that
//! the engine threads through every build and run operation.

pub mod config;
pub mod error;

pub use config::{IdMapping, SandboxOptions, Toolchain, FIXED_CREATED};
pub use error::{KilnError, Result};

/// Kiln version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
