//! Engine error taxonomy.
//!
//! Every failure that can reach a job result carries a stable code so
//! observers and the run log can classify it without string matching.
//! Skips are not errors: a file that produced no acceptable candidate
//! is a normal outcome and travels as a [`SkipReason`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stable error codes surfaced in job results and the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_DECODE")]
    Decode,
    #[serde(rename = "E_ENCODE")]
    Encode,
    #[serde(rename = "E_WRITE")]
    Write,
    #[serde(rename = "E_PERMISSION")]
    Permission,
    #[serde(rename = "E_LOCKED")]
    Locked,
    #[serde(rename = "E_UNSUPPORTED")]
    Unsupported,
    #[serde(rename = "E_UNKNOWN")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Decode => "E_DECODE",
            ErrorCode::Encode => "E_ENCODE",
            ErrorCode::Write => "E_WRITE",
            ErrorCode::Permission => "E_PERMISSION",
            ErrorCode::Locked => "E_LOCKED",
            ErrorCode::Unsupported => "E_UNSUPPORTED",
            ErrorCode::Unknown => "E_UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum OptimiseError {
    #[error("Failed to decode {path}: {detail}")]
    Decode { path: PathBuf, detail: String },

    #[error("{tool} failed (exit {exit_code:?}): {detail}")]
    Encode {
        tool: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("Encoder binary not found: {tool}")]
    ToolMissing { tool: String },

    #[error("Failed to write {path}: {detail}")]
    Write { path: PathBuf, detail: String },

    #[error("Output validation failed for {path}: {detail}")]
    Validation { path: PathBuf, detail: String },

    #[error("Permission denied: {path}")]
    Permission { path: PathBuf },

    #[error("File is locked by another process: {path}")]
    Locked { path: PathBuf },

    #[error("Unsupported input {path}: {detail}")]
    Unsupported { path: PathBuf, detail: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Refusing to run on protected directory: {path}")]
    DangerousDirectory { path: PathBuf },

    #[error("A run is already in progress")]
    RunInProgress,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OptimiseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            OptimiseError::Decode { .. } => ErrorCode::Decode,
            OptimiseError::Encode { .. } | OptimiseError::ToolMissing { .. } => ErrorCode::Encode,
            OptimiseError::Write { .. } | OptimiseError::Validation { .. } => ErrorCode::Write,
            OptimiseError::Permission { .. } => ErrorCode::Permission,
            OptimiseError::Locked { .. } => ErrorCode::Locked,
            OptimiseError::Unsupported { .. } => ErrorCode::Unsupported,
            OptimiseError::Io(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => ErrorCode::Permission,
                _ => ErrorCode::Unknown,
            },
            _ => ErrorCode::Unknown,
        }
    }

    /// Unknown errors are retryable by default; everything classified is
    /// deterministic and retrying would repeat the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code(), ErrorCode::Unknown | ErrorCode::Locked)
    }

    /// Classify an io::Error observed while touching `path`.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => OptimiseError::Permission {
                path: path.to_path_buf(),
            },
            // Sharing violations surface as WouldBlock/ResourceBusy on
            // the platforms we target.
            io::ErrorKind::WouldBlock => OptimiseError::Locked {
                path: path.to_path_buf(),
            },
            _ => OptimiseError::Io(err),
        }
    }
}

/// Serializable error payload for progress events and the run log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn from_error(err: &OptimiseError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Why a file ended `skipped` instead of producing an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyProcessed,
    NoCandidate,
    Larger,
    Unsupported,
    ReplaceTiff,
    TooLarge,
}

impl SkipReason {
    pub fn message(&self) -> &'static str {
        match self {
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::NoCandidate => "no candidate met threshold",
            SkipReason::Larger => "output would be larger than original",
            SkipReason::Unsupported => "unsupported file type",
            SkipReason::ReplaceTiff => "replace mode does not support TIFF inputs",
            SkipReason::TooLarge => "file exceeds the configured size cap",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
