//! Telemetry event dispatcher (spec §6): `loadStarted`/`loadCompleted`/
//! `loadCanceled`/`loadError`. Observational only — nothing here feeds
//! back into control flow.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::config::DataType;
use crate::error::TrackerError;

/// What kind of load a telemetry event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    Manifest,
    MediaPlaylist,
}

impl From<DataType> for LoadKind {
    fn from(value: DataType) -> Self {
        match value {
            DataType::Manifest => LoadKind::Manifest,
            DataType::MediaPlaylist => LoadKind::MediaPlaylist,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadErrorInfo {
    pub url: Url,
    pub kind: LoadKind,
    pub error: TrackerError,
    pub was_canceled: bool,
}

/// Telemetry sink a caller can supply to observe loader activity. Every
/// method has a no-op default so implementors only override what they use.
pub trait EventDispatcher: Send + Sync {
    fn load_started(&self, _url: &Url, _kind: LoadKind, _retry_count: u32) {}

    fn load_completed(&self, _url: &Url, _kind: LoadKind, _duration: Duration, _bytes: usize) {}

    fn load_canceled(&self, _url: &Url, _kind: LoadKind, _released: bool) {}

    fn load_error(&self, _info: &LoadErrorInfo) {}
}

/// An [`EventDispatcher`] that discards every event; the default when a
/// caller supplies none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventDispatcher;

impl EventDispatcher for NullEventDispatcher {}

/// Forwards every event to [`tracing`], at a density matched to what a
/// routine reload/backoff story deserves: starts and completions at
/// `debug`, errors at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventDispatcher;

impl EventDispatcher for TracingEventDispatcher {
    fn load_started(&self, url: &Url, kind: LoadKind, retry_count: u32) {
        tracing::debug!(%url, ?kind, retry_count, "load started");
    }

    fn load_completed(&self, url: &Url, kind: LoadKind, duration: Duration, bytes: usize) {
        tracing::debug!(%url, ?kind, duration_ms = duration.as_millis() as u64, bytes, "load completed");
    }

    fn load_canceled(&self, url: &Url, kind: LoadKind, released: bool) {
        tracing::debug!(%url, ?kind, released, "load canceled");
    }

    fn load_error(&self, info: &LoadErrorInfo) {
        tracing::warn!(url = %info.url, ?info.kind, was_canceled = info.was_canceled, error = %info.error, "load error");
    }
}

pub type SharedEventDispatcher = Arc<dyn EventDispatcher>;
