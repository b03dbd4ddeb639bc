use std::path::PathBuf;
use thiserror::Error;

/// The main error type for availai operations.
#[derive(Debug, Error)]
pub enum AvailaiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid dataset path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{backend} communication failed: {message}")]
    BackendCommunication { backend: String, message: String },

    #[error("Failed to parse metadata JSON '{input}': {source}")]
    MetadataParse {
        input: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to parse config from {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to parse artifact manifest {path}: {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl AvailaiError {
    /// Shorthand for a backend failure.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        AvailaiError::BackendCommunication {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// True for failures that came from a remote backend rather than from
    /// local input.
    pub fn is_backend(&self) -> bool {
        matches!(self, AvailaiError::BackendCommunication { .. })
    }
}
