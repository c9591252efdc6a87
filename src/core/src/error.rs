use thiserror::Error;

/// docker-squash error types
#[derive(Error, Debug)]
pub enum SquashError {
    /// Image store could not be reached after retries
    #[error("Image store unavailable: {0}")]
    StoreUnavailable(String),

    /// Referenced image or layer does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// manifest.json absent, empty or unparsable
    #[error("Manifest missing: {0}")]
    ManifestMissing(String),

    /// Image config absent or unparsable
    #[error("Image config missing: {0}")]
    ConfigMissing(String),

    /// Requested number of layers to squash is out of range
    #[error("Invalid number of layers to squash: {0}")]
    InvalidLayerCount(String),

    /// Only one layer selected; squashing would be a no-op
    #[error("Single layer marked to squash, no squashing is required")]
    SquashUnnecessary,

    /// Neither an output path nor loading into the store was requested
    #[error("no output path specified and loading into the store is not selected either; the squashed image would not be accessible")]
    NoSink,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reserved for layer integrity verification
    #[error("Hash mismatch: {0}")]
    HashMismatch(String),
}

impl SquashError {
    /// Process exit code reported for this error.
    ///
    /// An unnecessary squash is a distinct, non-fatal outcome (code 2);
    /// everything else is a generic failure (code 1).
    pub fn exit_code(&self) -> i32 {
        match self {
            SquashError::SquashUnnecessary => 2,
            _ => 1,
        }
    }
}

/// Result type alias for docker-squash operations
pub type Result<T> = std::result::Result<T, SquashError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_squash_unnecessary() {
        assert_eq!(SquashError::SquashUnnecessary.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_generic() {
        assert_eq!(SquashError::NoSink.exit_code(), 1);
        assert_eq!(
            SquashError::NotFound("nginx:latest".to_string()).exit_code(),
            1
        );
    }
}
