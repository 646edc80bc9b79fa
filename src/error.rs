//! Crawl error taxonomy.
//!
//! Per-URL failures ([`CrawlError::Transport`], [`CrawlError::HttpStatus`],
//! [`CrawlError::Timeout`], [`CrawlError::PolicyRejection`],
//! [`CrawlError::ExtractionFailure`]) never abort a session. Only
//! [`CrawlError::Store`] is fatal to a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("fetch of {url} timed out after {secs}s")]
    Timeout { url: String, secs: u64 },

    #[error("policy rejected {url}: {reason}")]
    PolicyRejection { url: String, reason: String },

    #[error("no usable text extracted from {url}")]
    ExtractionFailure { url: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("illegal frontier transition from '{from}' on {event}")]
    InvalidTransition { from: &'static str, event: String },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl CrawlError {
    /// Whether the frontier's retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::HttpStatus { .. } | Self::Timeout { .. }
        )
    }

    /// HTTP status recorded for diagnostics, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
