//! Error types for Hanzo Custody

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CustodyError {
    /// No live record for the id (absent or lazily expired)
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Access to private material refused. The cause is kept for
    /// diagnostics through `source()` and is never part of the message.
    #[error("Key access denied")]
    KeyAccessDenied {
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Secure store error: {0}")]
    Store(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CustodyError {
    /// Access denied with no recorded cause
    pub fn denied() -> Self {
        Self::KeyAccessDenied { source: None }
    }

    /// Access denied wrapping an underlying failure
    pub fn denied_by(cause: impl Into<anyhow::Error>) -> Self {
        Self::KeyAccessDenied {
            source: Some(cause.into()),
        }
    }

    /// True for the two kinds callers of the custodian may observe
    pub fn is_classified(&self) -> bool {
        matches!(self, Self::KeyNotFound(_) | Self::KeyAccessDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, CustodyError>;
