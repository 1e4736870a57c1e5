//! Error types for deltablob

use thiserror::Error;

/// Result type alias for deltablob operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for deltablob
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (local file system operations)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Bad container, path or configuration value. Never retried.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport failure surfaced by an object store after its own retries
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Signature data is truncated or internally inconsistent
    #[error("Corrupt signature: {message}")]
    CorruptSignature { message: String },

    /// A byte range of the target could not be resolved or verified
    #[error("Reconstruction integrity error: {message}")]
    ReconstructionIntegrity { message: String },

    /// Object not found in the store
    #[error("Object not found: {container}/{name}")]
    NotFound { container: String, name: String },

    /// Storage backend errors that are not transport related
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl Error {
    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a corrupt signature error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptSignature {
            message: message.into(),
        }
    }

    /// Create a reconstruction integrity error
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::ReconstructionIntegrity {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            container: container.into(),
            name: name.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Io { source, .. } => {
                use std::io::ErrorKind;
                matches!(
                    source.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: format!("TOML parse error: {}", err),
        }
    }
}
