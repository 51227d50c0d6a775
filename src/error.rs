//! Error taxonomy for the playlist tracker (see spec §7).

use std::sync::Arc;

/// Errors surfaced by the loader, parser, and tracker.
///
/// Variants map 1:1 onto the taxonomy in spec.md §7: `NetworkTransient`
/// and `NetworkFatal` are distinguished not by variant but by what the
/// retry policy decides to do with a [`Network`](Self::Network) error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackerError {
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid playlist URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("malformed manifest at {url}: {reason}")]
    MalformedManifest { url: String, reason: String },

    #[error("delta update could not be applied to previous snapshot of {url}: {reason}")]
    DeltaUpdateFailed { url: String, reason: String },

    #[error("expected {expected}, got {actual} at {url}")]
    UnexpectedResultType {
        url: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl TrackerError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source: Arc::new(source),
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status codes treated identically to a delta-update failure when
    /// raised against a blocking (`_HLS_msn`-carrying) request (spec.md
    /// §4.5, the `onError` bullet referencing RFC 8216 §6.2.5.2 / §6.3.7).
    /// Callers must additionally confirm the request was actually blocking
    /// — a plain reload or the manifest bootstrap returning 400/503 is
    /// ordinary transient failure, not this case.
    pub fn is_blocking_reload_rejection(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 400 | 503, .. })
    }

    /// Whether this error, raised against a `_HLS_msn`-carrying request,
    /// is itself the delta-update-failed case.
    pub fn is_delta_update_failed(&self) -> bool {
        matches!(self, Self::DeltaUpdateFailed { .. })
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrackerError>;
