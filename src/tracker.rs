//! Playlist Tracker (C6, spec §4.6): orchestrates the multivariant load,
//! owns one [`MediaPlaylistBundle`] per media-playlist URL, selects and
//! switches the primary variant, and fans out notifications.
//!
//! Re-expresses the source's cyclic tracker↔bundle object graph as single
//! ownership (spec §9): the tracker holds every bundle and loader by key,
//! bundles never hold a reference back. Rust's borrow checker enforces
//! the "single driver" concurrency model (spec §5) directly — `&mut self`
//! access to the tracker is the only way to mutate any bundle, so there is
//! no path to the overlapping mutation the spec's single-thread discipline
//! guards against. The `tokio::select!` loop in [`PlaylistTracker::run`]
//! is the same shape as the teacher's `SegmentScheduler::run()`
//! (`hls/scheduler.rs`): one branch drains expired timers, one drains
//! completed loads via `FuturesUnordered`, one watches for cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::bundle::{primary_change_reload_uri, BundleErrorKind, CompletedOutcome, ErrorOutcome, LoadDecision, MediaPlaylistBundle};
use crate::clock::{Clock, TimerWheel};
use crate::config::{DataType, TrackerConfig};
use crate::error::TrackerError;
use crate::events::SharedEventDispatcher;
use crate::listener::{first_primary_fallback_decision, PlaylistErrorInfo, PlaylistEventListener, PrimaryPlaylistListener};
use crate::loader::{LoadOutcome, Loader};
use crate::model::{MultivariantPlaylist, Snapshot, SnapshotData};
use crate::parser::{BootstrapPlaylist, PlaylistParser};
use crate::retry::{FallbackOptions, FallbackSelection, RetryPolicy};
use crate::source::{DataSource, LoadRequest};

struct MediaJobResult {
    url: Url,
    loader: Loader,
    started_ms: u64,
    is_blocking_request: bool,
    outcome: LoadOutcome<SnapshotData>,
}

type BoxedJob = Pin<Box<dyn Future<Output = MediaJobResult> + Send>>;

/// Singleton tracker state for one `start(...)` session (spec §3's
/// "Tracker state").
pub struct PlaylistTracker {
    config: TrackerConfig,
    clock: Clock,
    data_source: Arc<dyn DataSource>,
    parser: Arc<dyn PlaylistParser>,
    retry_policy: Arc<dyn RetryPolicy>,
    events: SharedEventDispatcher,

    multivariant: Option<MultivariantPlaylist>,
    bundles: HashMap<Url, MediaPlaylistBundle>,
    bundle_loaders: HashMap<Url, Loader>,
    manifest_loader: Loader,

    primary_url: Option<Url>,
    primary_snapshot: Option<Snapshot>,
    is_live: bool,
    initial_start_time_us: Option<u64>,
    first_primary_pending: bool,

    listeners: Vec<Arc<dyn PlaylistEventListener>>,
    primary_listener: Option<Arc<dyn PrimaryPlaylistListener>>,

    timers: TimerWheel<Url>,
    in_flight: FuturesUnordered<BoxedJob>,
}

impl PlaylistTracker {
    pub fn new(
        config: TrackerConfig,
        data_source: Arc<dyn DataSource>,
        parser: Arc<dyn PlaylistParser>,
        retry_policy: Arc<dyn RetryPolicy>,
        events: SharedEventDispatcher,
    ) -> Self {
        Self {
            config,
            clock: Clock::new(),
            data_source,
            parser,
            retry_policy,
            events,
            multivariant: None,
            bundles: HashMap::new(),
            bundle_loaders: HashMap::new(),
            manifest_loader: Loader::new(),
            primary_url: None,
            primary_snapshot: None,
            is_live: false,
            initial_start_time_us: None,
            first_primary_pending: false,
            listeners: Vec::new(),
            primary_listener: None,
            timers: TimerWheel::new(),
            in_flight: FuturesUnordered::new(),
        }
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PlaylistEventListener>) {
        self.listeners.push(listener);
    }

    /// `start(uri, listener)` (spec §4.6).
    pub async fn start(&mut self, uri: Url, primary_listener: Option<Arc<dyn PrimaryPlaylistListener>>) -> Result<(), TrackerError> {
        debug_assert!(self.multivariant.is_none(), "start() called on an already-started tracker");

        let request = LoadRequest::new(uri.clone());
        let parser = self.parser.clone();
        let base_url = uri.clone();
        let outcome = self
            .manifest_loader
            .start_load(request, DataType::Manifest, self.data_source.as_ref(), self.retry_policy.as_ref(), self.events.as_ref(), |bytes| {
                parser.parse_bootstrap(bytes, &base_url)
            })
            .await;

        let bootstrap = match outcome {
            LoadOutcome::Completed { result, .. } => result,
            LoadOutcome::Canceled { .. } => return Err(TrackerError::Cancelled),
            LoadOutcome::Error { error, .. } => return Err(error),
        };

        let now = self.clock.now_ms();
        self.primary_listener = primary_listener;
        self.first_primary_pending = true;

        match bootstrap {
            BootstrapPlaylist::Multivariant(mv) => {
                let primary_url = mv.variants.first().map(|v| v.url.clone());
                for url in &mv.media_playlist_urls {
                    self.bundles.entry(url.clone()).or_insert_with(|| MediaPlaylistBundle::new(url.clone()));
                }
                self.multivariant = Some(mv);
                self.primary_url = primary_url.clone();
                if let Some(url) = primary_url {
                    self.try_start_load(&url, false, now);
                }
            }
            BootstrapPlaylist::Media { url, snapshot } => {
                let mv = MultivariantPlaylist::single_variant(url.clone());
                self.bundles.entry(url.clone()).or_insert_with(|| MediaPlaylistBundle::new(url.clone()));
                self.multivariant = Some(mv);
                self.primary_url = Some(url.clone());

                let timing = self.config.playlist.clone();
                let Some(bundle) = self.bundles.get_mut(&url) else {
                    return Ok(());
                };
                let outcome = bundle.on_completed(snapshot, now, 0, None, &timing);
                self.after_completed(&url, outcome, now);
            }
        }

        Ok(())
    }

    /// `stop()` (spec §4.6): clears all state, releases all bundles,
    /// cancels timers.
    pub fn stop(&mut self) {
        self.manifest_loader.release();
        for loader in self.bundle_loaders.values_mut() {
            loader.release();
        }
        self.bundles.clear();
        self.bundle_loaders.clear();
        self.timers = TimerWheel::new();
        self.in_flight = FuturesUnordered::new();
        self.multivariant = None;
        self.primary_url = None;
        self.primary_snapshot = None;
        self.is_live = false;
        self.initial_start_time_us = None;
        self.first_primary_pending = false;
        self.listeners.clear();
        self.primary_listener = None;
    }

    /// `refreshPlaylist(url)` (spec §4.6): idempotent.
    pub fn refresh_playlist(&mut self, url: &Url) {
        let now = self.clock.now_ms();
        self.try_start_load(url, true, now);
    }

    /// `getPlaylistSnapshot(url, isForPlayback)` (spec §4.6).
    pub fn get_playlist_snapshot(&mut self, url: &Url, is_for_playback: bool) -> Option<Snapshot> {
        let snapshot = self.bundles.get(url).and_then(|b| b.snapshot()).cloned();
        if is_for_playback {
            self.maybe_set_primary_url(url.clone());
            if let Some(bundle) = self.bundles.get_mut(url) {
                bundle.active_for_playback = true;
            }
        }
        snapshot
    }

    /// `excludeMediaPlaylist(url, durMs) -> isExcluded` (spec §4.6).
    /// Semantics inverted from the bundle's internal exclude: returns
    /// `true` unless the url is the primary and no fallback exists.
    pub fn exclude_media_playlist(&mut self, url: Url, duration: Duration) -> bool {
        let now = self.clock.now_ms();
        let is_primary = self.primary_url.as_ref() == Some(&url);

        match self.bundles.get_mut(&url) {
            Some(bundle) => bundle.exclude(duration, now),
            None => return false,
        }

        if is_primary {
            return self.maybe_select_new_primary_url();
        }
        true
    }

    /// `maybeThrowPrimaryPlaylistRefreshError()` (spec §4.6).
    pub fn maybe_throw_primary_playlist_refresh_error(&self) -> Option<TrackerError> {
        if let Some(err) = self.manifest_loader.maybe_throw_error() {
            return Some(err.clone());
        }
        let primary_url = self.primary_url.as_ref()?;
        self.bundle_loaders.get(primary_url).and_then(|l| l.maybe_throw_error()).cloned()
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn get_multivariant_playlist(&self) -> Option<&MultivariantPlaylist> {
        self.multivariant.as_ref()
    }

    pub fn get_initial_start_time_us(&self) -> Option<u64> {
        self.initial_start_time_us
    }

    pub fn is_snapshot_valid(&self, url: &Url) -> bool {
        let now = self.clock.now_ms();
        self.bundles.get(url).is_some_and(|b| b.is_snapshot_valid(now, &self.config.playlist))
    }

    /// `maybeSetPrimaryUrl(url)` (spec §4.6).
    pub fn maybe_set_primary_url(&mut self, url: Url) {
        if self.primary_url.as_ref() == Some(&url) {
            return;
        }
        let Some(mv) = &self.multivariant else { return };
        if !mv.variants.iter().any(|v| v.url == url) {
            return;
        }
        // End-tag finality (spec §8): once the primary snapshot carries an
        // end tag, the stream has ended and no switch may occur.
        if self.primary_snapshot.as_ref().is_some_and(|s| s.has_end_tag) {
            return;
        }
        self.set_primary_url_internal(url);
    }

    /// `maybeSelectNewPrimaryUrl()` (spec §4.6). Returns `true` iff a new
    /// primary was promoted.
    pub fn maybe_select_new_primary_url(&mut self) -> bool {
        let now = self.clock.now_ms();
        let Some(mv) = &self.multivariant else { return false };
        let candidates: Vec<Url> = mv.variants.iter().map(|v| v.url.clone()).collect();
        for candidate in candidates {
            let usable = self
                .bundles
                .get(&candidate)
                .is_some_and(|b| b.exclude_until_ms().map(|t| t <= now).unwrap_or(true));
            if usable {
                self.set_primary_url_internal(candidate);
                return true;
            }
        }
        false
    }

    fn set_primary_url_internal(&mut self, url: Url) {
        let outgoing_snapshot = self.primary_snapshot.clone();
        self.primary_url = Some(url.clone());

        if let Some(new_snapshot) = self.bundles.get(&url).and_then(|b| b.snapshot()).cloned() {
            if new_snapshot.has_end_tag {
                let now = self.clock.now_ms();
                self.primary_snapshot = Some(new_snapshot.clone());
                self.on_primary_refreshed(&new_snapshot, now);
                return;
            }
        }

        let request_url = primary_change_reload_uri(&url, outgoing_snapshot.as_deref());
        let is_blocking_request = request_url.query_pairs().any(|(k, _)| k == "_HLS_msn");
        let Some(bundle) = self.bundles.get_mut(&url) else { return };
        if bundle.force_enter_loading() {
            self.start_job(url, request_url, is_blocking_request);
        }
    }

    fn on_primary_refreshed(&mut self, snapshot: &Snapshot, _now: u64) {
        if self.initial_start_time_us.is_none() {
            self.is_live = !snapshot.has_end_tag;
            self.initial_start_time_us = Some(snapshot.start_time_us);
        }
        if let Some(listener) = &self.primary_listener {
            listener.on_primary_playlist_refreshed(snapshot);
        }
    }

    fn notify_playlist_updated(&mut self, url: &Url, new_snapshot: &Snapshot, now: u64) {
        if self.primary_url.as_ref() == Some(url) {
            self.primary_snapshot = Some(new_snapshot.clone());
            self.on_primary_refreshed(new_snapshot, now);
        }
        self.first_primary_pending = false;
        for listener in &self.listeners {
            listener.on_playlist_changed();
        }
    }

    /// `notifyPlaylistError` (spec §4.6): returns `true` iff any listener
    /// declined to exclude.
    fn notify_playlist_error(&mut self, url: &Url, info: &PlaylistErrorInfo, force_retry: bool) -> bool {
        if self.first_primary_pending && self.primary_snapshot.is_none() {
            let now = self.clock.now_ms();
            let total = self.multivariant.as_ref().map(|m| m.variants.len() as u32).unwrap_or(0);
            let excluded = self
                .bundles
                .values()
                .filter(|b| b.exclude_until_ms().is_some_and(|t| t > now))
                .count() as u32;
            let decision = first_primary_fallback_decision(self.retry_policy.as_ref(), &info.error, total, excluded);
            if let Some(duration) = decision.exclude_for {
                self.exclude_media_playlist(url.clone(), duration);
            }
        }

        let mut any_declined = false;
        for listener in &self.listeners {
            if listener.on_playlist_error(info, force_retry) {
                any_declined = true;
            }
        }
        any_declined
    }

    fn maybe_exclude_after_error(&mut self, url: &Url, error: &TrackerError, now: u64) {
        let total = self.bundles.len() as u32;
        let excluded = self.bundles.values().filter(|b| b.exclude_until_ms().is_some_and(|t| t > now)).count() as u32;
        let options = FallbackOptions {
            total_locations: 1,
            excluded_locations: 0,
            total_tracks: total,
            excluded_tracks: excluded,
        };
        if let Some(FallbackSelection::Track { exclusion_duration }) = self.retry_policy.fallback_selection(options, error) {
            self.exclude_media_playlist(url.clone(), exclusion_duration);
        }
    }

    fn try_start_load(&mut self, url: &Url, allow_directives: bool, now: u64) {
        let Some(bundle) = self.bundles.get_mut(url) else { return };
        let decision = bundle.load_playlist(allow_directives, now);
        self.dispatch_load_decision(url.clone(), decision);
    }

    fn dispatch_load_decision(&mut self, bundle_url: Url, decision: LoadDecision) {
        match decision {
            LoadDecision::NoOp => {}
            LoadDecision::ScheduleAfter(delay) => {
                self.timers.schedule(delay, bundle_url);
            }
            LoadDecision::StartNow { url: request_url, is_blocking_directive } => {
                self.start_job(bundle_url, request_url, is_blocking_directive);
            }
        }
    }

    fn start_job(&mut self, bundle_url: Url, request_url: Url, is_blocking_request: bool) {
        let mut loader = self.bundle_loaders.remove(&bundle_url).unwrap_or_default();
        let data_source = self.data_source.clone();
        let retry_policy = self.retry_policy.clone();
        let events = self.events.clone();
        let parser = self.parser.clone();
        let previous = self.bundles.get(&bundle_url).and_then(|b| b.snapshot()).map(|s| (**s).clone());
        let request = LoadRequest::new(request_url);
        let started_ms = self.clock.now_ms();
        let url_for_parse = bundle_url.clone();
        let url_for_result = bundle_url.clone();

        let job: BoxedJob = Box::pin(async move {
            let outcome = loader
                .start_load(request, DataType::MediaPlaylist, data_source.as_ref(), retry_policy.as_ref(), events.as_ref(), |bytes| {
                    parser.parse_media_playlist(bytes, &url_for_parse, previous.as_ref())
                })
                .await;
            MediaJobResult {
                url: url_for_result,
                loader,
                started_ms,
                is_blocking_request,
                outcome,
            }
        });
        self.in_flight.push(job);
    }

    fn on_timer_fired(&mut self, url: Url) {
        let Some(bundle) = self.bundles.get_mut(&url) else { return };
        let decision = bundle.on_timer_fire(true);
        self.dispatch_load_decision(url, decision);
    }

    async fn handle_job_result(&mut self, job: MediaJobResult) {
        self.bundle_loaders.insert(job.url.clone(), job.loader);
        let now = self.clock.now_ms();
        let load_duration_ms = now.saturating_sub(job.started_ms);

        match job.outcome {
            LoadOutcome::Completed { result, .. } => {
                let primary_snapshot = self.primary_snapshot.clone();
                let timing = self.config.playlist.clone();
                let Some(bundle) = self.bundles.get_mut(&job.url) else { return };
                let outcome = bundle.on_completed(result, now, load_duration_ms, primary_snapshot.as_ref(), &timing);
                self.after_completed(&job.url, outcome, now);
            }
            LoadOutcome::Canceled { .. } => {}
            LoadOutcome::Error { error, fatal } => {
                let Some(bundle) = self.bundles.get_mut(&job.url) else { return };
                let outcome = bundle.on_error(error.clone(), fatal, now, job.is_blocking_request);
                self.after_error(&job.url, outcome, error, now);
            }
        }
    }

    fn after_completed(&mut self, url: &Url, outcome: CompletedOutcome, now: u64) {
        if outcome.snapshot_changed {
            self.notify_playlist_updated(url, &outcome.new_snapshot, now);
        } else if let Some(bundle_error) = &outcome.bundle_error {
            let force_retry = matches!(bundle_error.kind, BundleErrorKind::PlaylistReset);
            let info = PlaylistErrorInfo {
                url: url.clone(),
                error: TrackerError::Internal {
                    reason: format!("{:?}", bundle_error.kind),
                },
            };
            // Reset is never excluded (spec §4.5); stuck may be, via listeners.
            let declined = self.notify_playlist_error(url, &info, force_retry);
            if !force_retry && !declined {
                self.maybe_exclude_after_error(url, &info.error, now);
            }
        }

        if let Some(_delay) = outcome.reload_after {
            let is_active = self.primary_url.as_ref() == Some(url) || self.bundles.get(url).is_some_and(|b| b.active_for_playback);
            if is_active {
                self.try_start_load(url, true, now);
            }
        }
    }

    fn after_error(&mut self, url: &Url, outcome: ErrorOutcome, error: TrackerError, now: u64) {
        match outcome {
            ErrorOutcome::ImmediateNonDirectiveReload => {
                self.try_start_load(url, false, now);
            }
            ErrorOutcome::Notify { fatal } => {
                let info = PlaylistErrorInfo { url: url.clone(), error: error.clone() };
                let declined = self.notify_playlist_error(url, &info, false);
                if !declined {
                    self.maybe_exclude_after_error(url, &error, now);
                }
                let _ = fatal; // surfaced separately via maybe_throw_primary_playlist_refresh_error
            }
        }
    }

    /// Drives timers and in-flight loads until cancellation or until there
    /// is nothing left scheduled (e.g. every bundle has gone `Terminal`).
    pub async fn run(&mut self, cancellation: CancellationToken) {
        loop {
            if self.timers.is_empty() && self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancellation.cancelled() => break,
                url = self.timers.next(), if !self.timers.is_empty() => {
                    self.on_timer_fired(url);
                }
                Some(job) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.handle_job_result(job).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::events::NullEventDispatcher;
    use crate::parser::M3u8Parser;
    use crate::retry::DefaultRetryPolicy;
    use crate::source::LoadedBytes;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedSource {
        bodies: Mutex<HashMap<Url, Vec<u8>>>,
    }

    #[async_trait]
    impl DataSource for FixedSource {
        async fn fetch(&self, request: &LoadRequest) -> Result<LoadedBytes, TrackerError> {
            let bodies = self.bodies.lock().unwrap();
            let mut url = request.url.clone();
            url.set_query(None);
            match bodies.get(&url) {
                Some(body) => Ok(LoadedBytes {
                    body: body.clone(),
                    duration: Duration::from_millis(1),
                }),
                None => Err(TrackerError::HttpStatus {
                    status: 404,
                    url: request.url.to_string(),
                }),
            }
        }
    }

    fn tracker_with(bodies: HashMap<Url, Vec<u8>>) -> PlaylistTracker {
        let config = TrackerConfig::default();
        let source: Arc<dyn DataSource> = Arc::new(FixedSource { bodies: Mutex::new(bodies) });
        let parser: Arc<dyn PlaylistParser> = Arc::new(M3u8Parser);
        let retry: Arc<dyn RetryPolicy> = Arc::new(DefaultRetryPolicy::new(RetryConfig::default()));
        let events: SharedEventDispatcher = Arc::new(NullEventDispatcher);
        PlaylistTracker::new(config, source, parser, retry, events)
    }

    #[tokio::test]
    async fn start_on_vod_multivariant_sets_live_false_and_initial_start_time() {
        let master_url = Url::parse("https://example.com/master.m3u8").unwrap();
        let variant_url = Url::parse("https://example.com/a.m3u8").unwrap();

        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000\na.m3u8\n";
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:10.0,\ns0.ts\n#EXTINF:10.0,\ns1.ts\n#EXTINF:10.0,\ns2.ts\n#EXT-X-ENDLIST\n";

        let mut bodies = HashMap::new();
        bodies.insert(master_url.clone(), master.as_bytes().to_vec());
        bodies.insert(variant_url.clone(), media.as_bytes().to_vec());

        let mut tracker = tracker_with(bodies);
        tracker.start(master_url, None).await.unwrap();
        tracker.run(CancellationToken::new()).await;

        assert!(!tracker.is_live());
        assert_eq!(tracker.get_initial_start_time_us(), Some(0));
        let snapshot = tracker.get_playlist_snapshot(&variant_url, true).unwrap();
        assert!(snapshot.has_end_tag);
    }

    #[tokio::test]
    async fn single_media_playlist_bootstrap_synthesizes_single_variant() {
        let url = Url::parse("https://example.com/media/index.m3u8").unwrap();
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:6.0,\ns0.ts\n#EXT-X-ENDLIST\n";
        let mut bodies = HashMap::new();
        bodies.insert(url.clone(), media.as_bytes().to_vec());

        let mut tracker = tracker_with(bodies);
        tracker.start(url.clone(), None).await.unwrap();

        let mv = tracker.get_multivariant_playlist().unwrap();
        assert_eq!(mv.variants.len(), 1);
        assert!(tracker.get_playlist_snapshot(&url, true).is_some());
    }
}
