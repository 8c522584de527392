//! Error taxonomy for dispatch, fetching and stream resolution.
//!
//! Node-level, network and authentication failures propagate to the caller.
//! Row-level failures during structural parsing never appear here; they are
//! collected as [`RowFailure`](crate::orchestrator::RowFailure) entries.

use thiserror::Error;

/// Errors surfaced by the channel core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no parser registered for {url}")]
    NoParserFound { url: String },

    #[error("invalid parser definition '{label}': {reason}")]
    InvalidDefinition { label: String, reason: String },

    #[error("fetch of {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("HTTP {status} while fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("malformed payload from {url}: {reason}")]
    MalformedPayload { url: String, reason: String },

    #[error("{stage} failed for {url}: {source}")]
    ProcessorFailed {
        stage: ProcessorStage,
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no updater registered for {url}")]
    NoUpdater { url: String },

    #[error("updater failed for {url}: {source}")]
    UpdaterFailed {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("DRM protected content at {url} needs an adaptive engine with DRM support")]
    UnsupportedDrm { url: String },

    #[error("no adaptive engine available to play {url}")]
    NoAdaptiveEngine { url: String },

    #[error("invalid license key template: {0}")]
    InvalidLicenseTemplate(String),

    #[error("log-on required for {url} but no credentials are configured")]
    LogonRequired { url: String },

    #[error("log-on failed: {0}")]
    LogonFailed(#[source] anyhow::Error),

    #[error("unsupported snapshot version {found} (max supported {supported})")]
    SnapshotVersion { found: u32, supported: u32 },

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this failure came from the network layer.
    pub fn is_fetch(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::HttpStatus { .. })
    }
}

/// Pipeline stage a pre/postprocessor failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStage {
    Preprocessor,
    Postprocessor,
}

impl std::fmt::Display for ProcessorStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preprocessor => write!(f, "preprocessor"),
            Self::Postprocessor => write!(f, "postprocessor"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
