use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error surface shared by the dispatcher and every extraction backend.
///
/// Messages are written for direct display in the job status field, so
/// variants carry human-readable text rather than structured detail.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("cancelled")]
    Cancelled,
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("{0}")]
    Backend(String),
    #[error("{tool} exited with status {code:?}")]
    Process { tool: String, code: Option<i32> },
    #[error("network error: {0}")]
    Network(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("no playable media found: {0}")]
    NoMedia(String),
}

impl DownloadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        DownloadError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        DownloadError::Network(error.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for DownloadError {
    fn from(error: chromiumoxide::error::CdpError) -> Self {
        DownloadError::Browser(error.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
