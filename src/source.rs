//! Data-source factory (spec §6): "load this URI, gzip allowed, here are
//! request headers." Kept deliberately thin — the core only ever needs a
//! byte buffer back, never a stream it has to drive itself.
//!
//! The default implementation's header defaults are grounded on the
//! teacher's `DownloaderConfig::get_default_headers` (`config.rs`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use url::Url;

use crate::config::PlaylistTimingConfig;
use crate::error::TrackerError;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// A request for one playlist fetch (spec §4.2: `request = { uri, headers, parser }`).
/// `parser` itself lives in [`crate::parser`]; this carries only what the
/// data source needs.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub gzip_allowed: bool,
}

impl LoadRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
            gzip_allowed: true,
        }
    }
}

/// Raw bytes plus enough metadata for the loader's telemetry (spec §6:
/// `loadCompleted(parsedResult, durationMs, bytes)`).
#[derive(Debug, Clone)]
pub struct LoadedBytes {
    pub body: Vec<u8>,
    pub duration: Duration,
}

/// `createDataSource(kind) -> byteStream` (spec §6), collapsed to a single
/// async call since the core only ever consumes the full body.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch(&self, request: &LoadRequest) -> Result<LoadedBytes, TrackerError>;
}

/// reqwest-backed default [`DataSource`].
pub struct ReqwestDataSource {
    client: reqwest::Client,
}

impl ReqwestDataSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds the default client with a per-request timeout, matching the
    /// teacher's own `client.get(url).timeout(..)` request-building style
    /// (`hls/playlist.rs`). This bounds an individual HTTP round-trip, not
    /// the bundle's reload schedule — spec.md §5 forbids a *reload-level*
    /// global timeout, not a socket-level one on the underlying request.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .default_headers(Self::default_headers())
            .timeout(timeout)
            .build()
            .expect("static reqwest client configuration is always valid");
        Self::new(client)
    }

    /// Headers applied to every playlist fetch unless a request overrides
    /// them, matching the teacher's default header set for its general
    /// downloader (Accept-Encoding negotiated via the `gzip`/`deflate`
    /// `reqwest` features rather than spelled out here).
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/vnd.apple.mpegurl,application/x-mpegurl,*/*;q=0.8"),
        );
        headers.insert(reqwest::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }
}

impl Default for ReqwestDataSource {
    fn default() -> Self {
        Self::with_timeout(PlaylistTimingConfig::default().fetch_timeout)
    }
}

#[async_trait]
impl DataSource for ReqwestDataSource {
    async fn fetch(&self, request: &LoadRequest) -> Result<LoadedBytes, TrackerError> {
        let started = std::time::Instant::now();

        let mut builder = self.client.get(request.url.clone());
        if !request.headers.is_empty() {
            builder = builder.headers(request.headers.clone());
        }
        if !request.gzip_allowed {
            builder = builder.header(reqwest::header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TrackerError::network(request.url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus {
                status: status.as_u16(),
                url: request.url.to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TrackerError::network(request.url.as_str(), e))?
            .to_vec();

        Ok(LoadedBytes {
            body,
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_request_defaults_to_gzip_allowed() {
        let req = LoadRequest::new(Url::parse("https://example.com/master.m3u8").unwrap());
        assert!(req.gzip_allowed);
        assert!(req.headers.is_empty());
    }
}
