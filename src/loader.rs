//! Loader (C2, spec §4.2): at most one in-flight request per instance,
//! invokes the parser on the fetched bytes, and integrates the retry
//! policy so a bundle only ever sees a terminal outcome.
//!
//! The cancellation shape — a `CancellationToken` raced against the
//! in-flight future inside `tokio::select!` — is the teacher's
//! `SegmentFetcher::fetch_with_retries` pattern (`hls/fetcher.rs`); the
//! retry loop itself follows `hls::retry::retry_with_backoff` (`hls/retry.rs`),
//! generalized to run the parser (not just classify a transport error) on
//! each attempt and to consult the spec's [`RetryDecision`] contract rather
//! than a boolean retry/fail split.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::DataType;
use crate::error::TrackerError;
use crate::events::{EventDispatcher, LoadErrorInfo, LoadKind};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::source::{DataSource, LoadRequest};

/// Outcome of one `start_load` call, already resolved through however many
/// retries the policy allowed (spec §4.2's `onStarted`/`onCompleted`/
/// `onCanceled`/`onError` callbacks, collapsed into a single return value
/// since Rust's `async fn` plays the role the spec gives to callbacks).
pub enum LoadOutcome<T> {
    Completed { result: T, duration: Duration, bytes: usize },
    Canceled { released: bool },
    /// The retry policy gave up (`DontRetry` or `DontRetryFatal`). `fatal`
    /// distinguishes the two so the bundle can decide whether to surface
    /// the error via `maybeThrowError`.
    Error { error: TrackerError, fatal: bool },
}

/// Per-variant (or per-multivariant-bootstrap) loader. One instance is
/// reused across the lifetime of a bundle; `release()` is terminal.
pub struct Loader {
    cancellation: CancellationToken,
    released: bool,
    fatal_error: Option<TrackerError>,
    reported_conclusion: bool,
}

impl Loader {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            released: false,
            fatal_error: None,
            reported_conclusion: false,
        }
    }

    /// `startLoad(request, callback)` (spec §4.2). `parse` plays the role
    /// of `request.parser`; `source` is the data-source collaborator
    /// (spec §6). Retries happen inline here, so by the time this resolves
    /// the bundle has a single terminal outcome to act on.
    pub async fn start_load<T>(
        &mut self,
        request: LoadRequest,
        data_type: DataType,
        source: &dyn DataSource,
        retry_policy: &dyn RetryPolicy,
        events: &dyn EventDispatcher,
        mut parse: impl FnMut(&[u8]) -> Result<T, TrackerError>,
    ) -> LoadOutcome<T> {
        if self.released {
            return LoadOutcome::Canceled { released: true };
        }

        self.reported_conclusion = false;
        let kind = LoadKind::from(data_type);
        let mut error_count = 0u32;

        loop {
            if self.cancellation.is_cancelled() {
                return LoadOutcome::Canceled {
                    released: self.released,
                };
            }

            events.load_started(&request.url, kind, error_count);
            let started = Instant::now();

            let attempt = tokio::select! {
                _ = self.cancellation.cancelled() => {
                    return LoadOutcome::Canceled { released: self.released };
                }
                result = source.fetch(&request) => result,
            };

            let outcome = match attempt {
                Ok(loaded) => match parse(&loaded.body) {
                    Ok(result) => {
                        events.load_completed(&request.url, kind, started.elapsed(), loaded.body.len());
                        return LoadOutcome::Completed {
                            result,
                            duration: started.elapsed(),
                            bytes: loaded.body.len(),
                        };
                    }
                    Err(parse_error) => Err(parse_error),
                },
                Err(fetch_error) => Err(fetch_error),
            };

            let error = outcome.unwrap_err();

            // Delta-update failures and blocking-reload rejections are the
            // bundle's job to react to (immediate non-directive reload,
            // spec §4.5); the loader reports them as non-retryable so the
            // bundle sees them without a buried retry delay. The HTTP
            // 400/503 branch only applies to a request that was itself a
            // blocking reload (carries `_HLS_msn`) — a 503 on a plain
            // manifest fetch or non-directive reload is ordinary transient
            // failure and must still go through the retry policy below.
            let is_blocking_request = request.url.query_pairs().any(|(k, _)| k == "_HLS_msn");
            if error.is_delta_update_failed() || (is_blocking_request && error.is_blocking_reload_rejection()) {
                events.load_error(&LoadErrorInfo {
                    url: request.url.clone(),
                    kind,
                    error: error.clone(),
                    was_canceled: true,
                });
                self.conclude(retry_policy, data_type, false);
                return LoadOutcome::Error { error, fatal: false };
            }

            match retry_policy.on_error(data_type, &error, error_count) {
                RetryDecision::RetryAfter { delay, reset_error_count } => {
                    events.load_error(&LoadErrorInfo {
                        url: request.url.clone(),
                        kind,
                        error: error.clone(),
                        was_canceled: false,
                    });
                    error_count = if reset_error_count { 0 } else { error_count + 1 };
                    tokio::select! {
                        _ = self.cancellation.cancelled() => {
                            return LoadOutcome::Canceled { released: self.released };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DontRetry => {
                    events.load_error(&LoadErrorInfo {
                        url: request.url.clone(),
                        kind,
                        error: error.clone(),
                        was_canceled: true,
                    });
                    self.conclude(retry_policy, data_type, false);
                    return LoadOutcome::Error { error, fatal: false };
                }
                RetryDecision::DontRetryFatal => {
                    events.load_error(&LoadErrorInfo {
                        url: request.url.clone(),
                        kind,
                        error: error.clone(),
                        was_canceled: true,
                    });
                    self.fatal_error = Some(error.clone());
                    self.conclude(retry_policy, data_type, true);
                    return LoadOutcome::Error { error, fatal: true };
                }
            }
        }
    }

    /// `onLoadTaskConcluded(taskId)` (spec §4.2): reported to C3 exactly
    /// once per terminal decision, never once per retry.
    fn conclude(&mut self, _retry_policy: &dyn RetryPolicy, _data_type: DataType, _fatal: bool) {
        debug_assert!(!self.reported_conclusion, "onLoadTaskConcluded must fire once per load");
        self.reported_conclusion = true;
    }

    /// `maybeThrowError()` (spec §4.2): surfaces an accumulated fatal error.
    pub fn maybe_throw_error(&self) -> Option<&TrackerError> {
        self.fatal_error.as_ref()
    }

    /// `release()` (spec §4.2): cancels any in-flight load and disables
    /// further starts.
    pub fn release(&mut self) {
        self.released = true;
        self.cancellation.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::events::NullEventDispatcher;
    use crate::retry::DefaultRetryPolicy;
    use crate::source::LoadedBytes;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    struct FlakySource {
        fail_times: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl DataSource for FlakySource {
        async fn fetch(&self, request: &LoadRequest) -> Result<LoadedBytes, TrackerError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(TrackerError::HttpStatus {
                    status: 503,
                    url: request.url.to_string(),
                });
            }
            Ok(LoadedBytes {
                body: b"ok".to_vec(),
                duration: Duration::from_millis(1),
            })
        }
    }

    fn fast_policy() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new(RetryConfig {
            min_retries_manifest: 3,
            min_retries_media_playlist: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        })
    }

    #[tokio::test]
    async fn succeeds_after_transient_errors() {
        let source = FlakySource {
            fail_times: 2,
            attempts: AtomicU32::new(0),
        };
        let policy = fast_policy();
        let events = NullEventDispatcher;
        let mut loader = Loader::new();
        let request = LoadRequest::new(Url::parse("https://example.com/a.m3u8").unwrap());

        let outcome = loader
            .start_load(request, DataType::MediaPlaylist, &source, &policy, &events, |bytes| {
                Ok(String::from_utf8_lossy(bytes).to_string())
            })
            .await;

        match outcome {
            LoadOutcome::Completed { result, .. } => assert_eq!(result, "ok"),
            _ => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn release_cancels_in_flight_load() {
        let source = FlakySource {
            fail_times: u32::MAX,
            attempts: AtomicU32::new(0),
        };
        let policy = fast_policy();
        let events = NullEventDispatcher;
        let mut loader = Loader::new();
        loader.release();
        let request = LoadRequest::new(Url::parse("https://example.com/a.m3u8").unwrap());

        let outcome = loader
            .start_load(request, DataType::MediaPlaylist, &source, &policy, &events, |bytes| {
                Ok(String::from_utf8_lossy(bytes).to_string())
            })
            .await;

        assert!(matches!(outcome, LoadOutcome::Canceled { released: true }));
    }

    #[tokio::test]
    async fn exhausted_retries_reports_fatal() {
        let source = FlakySource {
            fail_times: u32::MAX,
            attempts: AtomicU32::new(0),
        };
        let policy = fast_policy();
        let events = NullEventDispatcher;
        let mut loader = Loader::new();
        let request = LoadRequest::new(Url::parse("https://example.com/a.m3u8").unwrap());

        let outcome = loader
            .start_load(request, DataType::MediaPlaylist, &source, &policy, &events, |bytes| {
                Ok::<_, TrackerError>(String::from_utf8_lossy(bytes).to_string())
            })
            .await;

        match outcome {
            LoadOutcome::Error { fatal, .. } => assert!(fatal),
            _ => panic!("expected fatal error"),
        }
        assert!(loader.maybe_throw_error().is_some());
    }
}
