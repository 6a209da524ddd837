//! Error handling module for imageprep
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Task handlers and config loading use `anyhow` at their boundaries; everything
//! that crosses a module seam uses these types.

use thiserror::Error;

/// Main error type for imageprep
#[derive(Error, Debug)]
pub enum ImagePrepError {
    /// IO errors (state file, cache copy, process spawn)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// External process could not be started or awaited
    #[error("Process error: {0}")]
    Process(String),

    /// Relocation to the local cache failed
    #[error("Relaunch error: {0}")]
    Relaunch(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for imageprep operations
pub type Result<T> = std::result::Result<T, ImagePrepError>;

impl ImagePrepError {
    /// Create a process error
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create a relaunch error
    pub fn relaunch(msg: impl Into<String>) -> Self {
        Self::Relaunch(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ImagePrepError::process("spawn failed");
        assert_eq!(err.to_string(), "Process error: spawn failed");

        let err = ImagePrepError::relaunch("copy failed");
        assert_eq!(err.to_string(), "Relaunch error: copy failed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ImagePrepError = io_err.into();
        assert!(matches!(err, ImagePrepError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: ImagePrepError = json_err.into();
        assert!(matches!(err, ImagePrepError::Json(_)));
        assert!(err.to_string().starts_with("JSON error:"));
    }
}
