//! Error types for discovery and transfer operations.

use thiserror::Error;

/// Main error type for vault operations.
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Source path does not exist: {0}")]
    SourceNotFound(String),

    #[error("Hash verification failed for {path} after {attempts} attempt(s)")]
    HashMismatch { path: String, attempts: u32 },

    #[error("Could not read {unread} director(ies) under {path}; the source was left in place")]
    IncompleteSource { path: String, unread: usize },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Target {target_path} overlaps source {source_path}: {reason}")]
    PathOverlap {
        source_path: String,
        target_path: String,
        reason: &'static str,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No free name for {0} after {1} attempts")]
    UniqueNameExhausted(String, u32),

    #[error("FTP connection to {endpoint} failed: {message}")]
    FtpConnect { endpoint: String, message: String },

    #[error("FTP error: {0}")]
    Ftp(String),

    #[error(
        "Remote directory {path} is not accessible ({message}); check that the drive is mounted and the path is correct"
    )]
    RemoteDirInaccessible { path: String, message: String },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// True when the user aborted the operation, as opposed to a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VaultError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultError::Internal(format!("background task failed: {err}"))
    }
}

impl serde::Serialize for VaultError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
