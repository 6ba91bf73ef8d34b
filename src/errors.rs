use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),
    #[error("Invalid version string: {0}")]
    VersionParse(String),
    #[error("Insufficient storage: need {required} bytes, {available} available")]
    InsufficientStorage { required: u64, available: u64 },
    #[error("Download cancelled")]
    Cancelled,
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, LauncherError>;

/// Why a download task ended in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NetworkError,
    ChecksumMismatch,
    CorruptArchive,
    WriteError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::NetworkError => "network error",
            FailureReason::ChecksumMismatch => "checksum mismatch",
            FailureReason::CorruptArchive => "corrupt archive",
            FailureReason::WriteError => "write error",
        };
        f.write_str(label)
    }
}

impl LauncherError {
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            LauncherError::Network(_) | LauncherError::Http(_) => FailureReason::NetworkError,
            LauncherError::ChecksumMismatch { .. } => FailureReason::ChecksumMismatch,
            LauncherError::CorruptArchive(_) => FailureReason::CorruptArchive,
            _ => FailureReason::WriteError,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LauncherError::Cancelled)
    }
}
