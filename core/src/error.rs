use thiserror::Error;

/// Kiln error types.
///
/// These cover the genuinely unexpected conditions that abort a build.
/// External tools exiting non-zero are not errors: they are carried as data
/// in `ExecutionResult` and `FallibleImageBundle` so a failing layer step
/// surfaces its captured output instead of unwinding.
#[derive(Error, Debug)]
pub enum KilnError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Image layout metadata is missing or unparsable
    #[error("Malformed image metadata: {0}")]
    MalformedImageMetadata(String),

    /// No registered builder claims a target
    #[error("No registered builder can build target {address}")]
    NoBuilder { address: String },

    /// More than one registered builder claims a target
    #[error("It is ambiguous which builder should build target {address}. Candidates: {}", candidates.join(", "))]
    AmbiguousBuilder {
        address: String,
        candidates: Vec<String>,
    },

    /// More than one pre-built layer artifact in a single build step
    #[error("Target {address} produced {count} pre-built layers; a build step supports exactly one")]
    MultipleLayers { address: String, count: usize },

    /// A required external tool is missing
    #[error("Required tool `{name}` was not found on PATH")]
    ToolNotFound { name: String },

    /// Content store error
    #[error("Store error: {0}")]
    Store(String),

    /// Sandbox setup or output capture error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        KilnError::Serialization(err.to_string())
    }
}

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KilnError = io_error.into();
        assert!(matches!(err, KilnError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let err: KilnError = result.unwrap_err().into();
        assert!(matches!(err, KilnError::Serialization(_)));
    }

    #[test]
    fn test_ambiguous_builder_lists_candidates() {
        let err = KilnError::AmbiguousBuilder {
            address: "images/app".to_string(),
            candidates: vec!["build".to_string(), "python".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("images/app"));
        assert!(message.contains("build, python"));
    }

    #[test]
    fn test_no_builder_display() {
        let err = KilnError::NoBuilder {
            address: "images/app".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No registered builder can build target images/app"
        );
    }

    #[test]
    fn test_multiple_layers_display() {
        let err = KilnError::MultipleLayers {
            address: "layers/runtime".to_string(),
            count: 2,
        };
        assert!(err.to_string().contains("2 pre-built layers"));
    }

    #[test]
    fn test_tool_not_found_display() {
        let err = KilnError::ToolNotFound {
            name: "umoci".to_string(),
        };
        assert_eq!(err.to_string(), "Required tool `umoci` was not found on PATH");
    }

    #[test]
    fn test_malformed_metadata_display() {
        let err = KilnError::MalformedImageMetadata("missing build/index.json".to_string());
        assert!(err.to_string().starts_with("Malformed image metadata:"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<u32> {
            Ok(7)
        }

        fn returns_err() -> Result<u32> {
            Err(KilnError::Store("corrupt blob".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 7);
        assert!(returns_err().is_err());
    }
}
