use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported by a [`Transport`](super::Transport) implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resume data for {url} is not usable: {reason}")]
    ResumeRejected { url: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors delivered to download completion callbacks.
///
/// A single terminal outcome is fanned out to every caller sharing a transfer,
/// so the error is cheap to clone: underlying sources sit behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Bad URL or destination path. No task is created.
    #[error("invalid download request: {reason}")]
    InvalidRequest { reason: String },

    /// The transport reported a failure. Surfaced verbatim to all observers.
    #[error("transfer of {url} failed: {source}")]
    TransferFailed {
        url: String,
        #[source]
        source: Arc<TransportError>,
    },

    /// The observer's interest in the download was cancelled.
    #[error("download of {url} was cancelled")]
    Cancelled { url: String },

    /// Moving a finished file into place or clearing the cache failed.
    #[error("filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl DownloadError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn transfer_failed(url: impl Into<String>, source: TransportError) -> Self {
        Self::TransferFailed {
            url: url.into(),
            source: Arc::new(source),
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
