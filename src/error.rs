use std::io;
use thiserror::Error;

/// Main error type for dysk operations
#[derive(Error, Debug)]
pub enum DyskError {
    #[error("{0}")]
    Validation(String),

    #[error("Failed to decode device record: {0}")]
    Decode(String),

    #[error("Failed to encode device record: {0}")]
    Encode(String),

    #[error("Control channel error: {0}")]
    Channel(#[source] io::Error),

    #[error("{0}")]
    Device(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Lease already present: {0}")]
    LeaseAlreadyPresent(String),

    #[error("Lease mismatch: {0}")]
    LeaseMismatch(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DyskError {
    /// Process exit code for the CLI, one per error category
    pub fn exit_code(&self) -> i32 {
        match self {
            DyskError::Validation(_) | DyskError::Encode(_) => 2,
            DyskError::Config(_) => 3,
            DyskError::Channel(_) => 4,
            DyskError::Device(_) | DyskError::Decode(_) => 5,
            DyskError::NotFound(_)
            | DyskError::LeaseAlreadyPresent(_)
            | DyskError::LeaseMismatch(_)
            | DyskError::Backend(_) => 6,
            DyskError::Serialization(_) | DyskError::Io(_) => 1,
        }
    }

    /// True for errors raised by the blob service
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            DyskError::NotFound(_)
                | DyskError::LeaseAlreadyPresent(_)
                | DyskError::LeaseMismatch(_)
                | DyskError::Backend(_)
        )
    }
}

impl From<reqwest::Error> for DyskError {
    fn from(err: reqwest::Error) -> Self {
        DyskError::Backend(err.to_string())
    }
}

/// Result type alias for dysk operations
pub type Result<T> = std::result::Result<T, DyskError>;
