//! Error types shared by every cache operation
//!
//! `CacheError` is `Clone` because a single download outcome is fanned out to
//! every caller joined on the same job.

use serde::Serialize;
use thiserror::Error;

/// Result alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache and download errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Identifier/variant unknown to the registry, or absent from every source
    #[error("model '{model}' not found: {reason}")]
    NotFound { model: String, reason: String },

    /// Transient network or storage failure
    #[error("source unavailable ({uri}): {reason}")]
    SourceUnavailable { uri: String, reason: String },

    #[error("checksum mismatch for '{model}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        model: String,
        expected: String,
        actual: String,
    },

    #[error(
        "insufficient space for '{model}': need {needed} bytes, budget {budget} bytes, {available} bytes obtainable by eviction"
    )]
    InsufficientSpace {
        model: String,
        needed: u64,
        budget: u64,
        available: u64,
    },

    #[error("download of '{model}' was aborted")]
    Aborted { model: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Closed set of error kinds, used for exit codes and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    SourceUnavailable,
    ChecksumMismatch,
    InsufficientSpace,
    Aborted,
    Io,
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "NotFound",
            Self::SourceUnavailable => "SourceUnavailable",
            Self::ChecksumMismatch => "ChecksumMismatch",
            Self::InsufficientSpace => "InsufficientSpace",
            Self::Aborted => "Aborted",
            Self::Io => "Io",
            Self::Config => "Config",
        };
        f.write_str(name)
    }
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            Self::Aborted { .. } => ErrorKind::Aborted,
            Self::Io(_) => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Only transient source failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. })
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::NotFound => 2,
            ErrorKind::SourceUnavailable => 3,
            ErrorKind::ChecksumMismatch => 4,
            ErrorKind::InsufficientSpace => 5,
            ErrorKind::Aborted => 130,
            ErrorKind::Io | ErrorKind::Config => 1,
        }
    }

    pub(crate) fn not_found(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotFound {
            model: model.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap an I/O error with the path it happened on
    pub(crate) fn io(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Self::Io(format!("{}: {}", context, err))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}
