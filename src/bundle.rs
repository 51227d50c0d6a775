//! Media Playlist Bundle (C5, spec §4.5): the per-variant state machine.
//!
//! Per the design note in spec.md §9 ("recurring timer loop"), this is
//! modeled as a state machine whose transition methods return a decision
//! for a thin driver to act on (`tracker.rs`'s `tokio::select!` loop) —
//! no bundle method performs I/O or touches a clock directly, echoing how
//! the teacher's `BatchScheduler` (`hls/scheduler.rs`) keeps its job state
//! a plain synchronous structure driven by an outer `run()` loop.

use std::time::Duration;
use std::sync::Arc;

use url::Url;

use crate::model::{Snapshot, SnapshotData};
use crate::reconciler::reconcile;
use crate::config::PlaylistTimingConfig;
use crate::error::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    Idle,
    Waiting,
    Loading,
    Excluded,
    Terminal,
}

/// Bundle-local error classification surfaced to listeners (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleErrorKind {
    PlaylistReset,
    PlaylistStuck,
    LoadFailed,
}

#[derive(Debug, Clone)]
pub struct BundleError {
    pub kind: BundleErrorKind,
    pub error: Option<TrackerError>,
}

/// What the driver should do after calling [`MediaPlaylistBundle::load_playlist`]
/// or [`MediaPlaylistBundle::on_timer_fire`].
pub enum LoadDecision {
    /// Already loading, already pending, or fatally failed: no-op.
    NoOp,
    /// Not yet due; the driver should schedule a timer for `delay` and
    /// call [`MediaPlaylistBundle::on_timer_fire`] when it expires.
    ScheduleAfter(Duration),
    /// Due now; the driver should fetch `url` immediately.
    StartNow { url: Url, is_blocking_directive: bool },
}

/// Result of [`MediaPlaylistBundle::on_completed`].
pub struct CompletedOutcome {
    pub snapshot_changed: bool,
    pub new_snapshot: Snapshot,
    pub bundle_error: Option<BundleError>,
    /// `Some` unless the bundle has gone terminal (end tag) or is inactive
    /// (not primary, not active for playback) and should not self-reload.
    pub reload_after: Option<Duration>,
}

/// Result of [`MediaPlaylistBundle::on_error`].
pub enum ErrorOutcome {
    /// Delta-update failure, or HTTP 400/503 on a blocking request
    /// (spec §4.5, §7): reload immediately without delivery directives.
    ImmediateNonDirectiveReload,
    /// A terminal (non-retryable) failure the tracker should route to
    /// listeners; `fatal` distinguishes `DontRetryFatal` from `DontRetry`.
    Notify { fatal: bool },
}

/// One media-playlist URL's reload state (spec §3's "Bundle state").
pub struct MediaPlaylistBundle {
    pub url: Url,
    snapshot: Option<Snapshot>,
    last_snapshot_load_ms: u64,
    last_snapshot_change_ms: u64,
    earliest_next_load_ms: u64,
    exclude_until_ms: Option<u64>,
    load_pending: bool,
    loading: bool,
    fatal: bool,
    playlist_error: Option<BundleError>,
    pub active_for_playback: bool,
}

impl MediaPlaylistBundle {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            snapshot: None,
            last_snapshot_load_ms: 0,
            last_snapshot_change_ms: 0,
            earliest_next_load_ms: 0,
            exclude_until_ms: None,
            load_pending: false,
            loading: false,
            fatal: false,
            playlist_error: None,
            active_for_playback: false,
        }
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn playlist_error(&self) -> Option<&BundleError> {
        self.playlist_error.as_ref()
    }

    pub fn state(&self, now_ms: u64) -> BundleState {
        if self.snapshot.as_ref().is_some_and(|s| s.has_end_tag) {
            return BundleState::Terminal;
        }
        if self.exclude_until_ms.is_some_and(|t| t > now_ms) {
            return BundleState::Excluded;
        }
        if self.loading {
            return BundleState::Loading;
        }
        if self.load_pending {
            return BundleState::Waiting;
        }
        BundleState::Idle
    }

    /// `loadPlaylist(allowDirectives)` (spec §4.5).
    pub fn load_playlist(&mut self, allow_directives: bool, now_ms: u64) -> LoadDecision {
        if self.loading || self.load_pending || self.fatal {
            return LoadDecision::NoOp;
        }
        if now_ms < self.earliest_next_load_ms {
            self.load_pending = true;
            return LoadDecision::ScheduleAfter(Duration::from_millis(self.earliest_next_load_ms - now_ms));
        }
        self.enter_loading(allow_directives)
    }

    /// Fires when a timer set up by a previous [`LoadDecision::ScheduleAfter`]
    /// expires: clears `loadPending` and enters `Loading` (spec §4.5).
    ///
    /// If the bundle is already `Loading` — because [`Self::force_enter_loading`]
    /// started an out-of-band primary-change reload while this timer was
    /// still pending — the timer fires into a no-op rather than starting a
    /// second concurrent load for the same bundle (spec §8's
    /// at-most-one-in-flight invariant).
    pub fn on_timer_fire(&mut self, allow_directives: bool) -> LoadDecision {
        self.load_pending = false;
        if self.loading {
            return LoadDecision::NoOp;
        }
        self.enter_loading(allow_directives)
    }

    fn enter_loading(&mut self, allow_directives: bool) -> LoadDecision {
        self.loading = true;
        // A successful reload always re-admits the variant (spec §4.5).
        self.exclude_until_ms = None;
        let url = if allow_directives {
            self.reload_uri()
        } else {
            self.url.clone()
        };
        let is_blocking_directive = url.query_pairs().any(|(k, _)| k == "_HLS_msn");
        LoadDecision::StartNow { url, is_blocking_directive }
    }

    /// Reload URI construction (spec §4.5).
    pub fn reload_uri(&self) -> Url {
        build_reload_uri(&self.url, self.snapshot.as_deref())
    }

    /// `onCompleted(loaded)` (spec §4.5).
    pub fn on_completed(
        &mut self,
        loaded: SnapshotData,
        now_ms: u64,
        load_duration_ms: u64,
        primary: Option<&Snapshot>,
        timing: &PlaylistTimingConfig,
    ) -> CompletedOutcome {
        self.loading = false;
        self.last_snapshot_load_ms = now_ms;

        let loaded_media_sequence = loaded.media_sequence;
        let loaded_segment_count = loaded.segments.len() as u64;

        let old_snapshot = self.snapshot.clone();
        let new_snapshot = reconcile(old_snapshot.as_ref(), loaded, primary);

        let changed = match &old_snapshot {
            Some(old) => !Arc::ptr_eq(old, &new_snapshot),
            None => true,
        };

        let mut bundle_error = None;

        if changed {
            self.playlist_error = None;
            self.last_snapshot_change_ms = now_ms;
            self.snapshot = Some(new_snapshot.clone());
        } else if !new_snapshot.has_end_tag {
            if loaded_media_sequence + loaded_segment_count < new_snapshot.media_sequence {
                bundle_error = Some(BundleError {
                    kind: BundleErrorKind::PlaylistReset,
                    error: None,
                });
            } else {
                let stuck_threshold_ms =
                    (new_snapshot.target_duration_us as f64 / 1000.0) * timing.stuck_coefficient;
                if (now_ms.saturating_sub(self.last_snapshot_change_ms)) as f64 > stuck_threshold_ms {
                    bundle_error = Some(BundleError {
                        kind: BundleErrorKind::PlaylistStuck,
                        error: None,
                    });
                }
            }
            self.snapshot = Some(new_snapshot.clone());
            self.playlist_error = bundle_error.clone();
        }

        let reload_after = if new_snapshot.has_end_tag {
            None
        } else {
            let delay_us = next_load_delay_us(&new_snapshot, changed);
            let delay_ms = delay_us / 1000;
            self.earliest_next_load_ms = (now_ms + delay_ms).saturating_sub(load_duration_ms);
            Some(Duration::from_millis(delay_ms))
        };

        CompletedOutcome {
            snapshot_changed: changed,
            new_snapshot,
            bundle_error,
            reload_after,
        }
    }

    /// `onError(err, errorCount)` (spec §4.5, §7). `is_blocking_request`
    /// tells whether the failed request itself carried `_HLS_msn`: a
    /// 400/503 only forces an immediate non-directive reload when it was
    /// raised against a blocking request (spec §4.5) — the same status on
    /// a plain reload or the manifest bootstrap is ordinary transient
    /// failure and falls through to the notify/exclude path below.
    pub fn on_error(&mut self, error: TrackerError, fatal: bool, now_ms: u64, is_blocking_request: bool) -> ErrorOutcome {
        self.loading = false;

        if error.is_delta_update_failed() || (is_blocking_request && error.is_blocking_reload_rejection()) {
            self.earliest_next_load_ms = now_ms;
            return ErrorOutcome::ImmediateNonDirectiveReload;
        }

        self.playlist_error = Some(BundleError {
            kind: BundleErrorKind::LoadFailed,
            error: Some(error),
        });
        if fatal {
            self.fatal = true;
        }
        ErrorOutcome::Notify { fatal }
    }

    /// Forces entry into `Loading` for a primary-change reload (spec §4.5,
    /// "Primary-change reload URI"), bypassing the normal
    /// `earliestNextLoadMs` gate: a primary switch must refresh
    /// immediately regardless of when this bundle last loaded. Returns
    /// `false` if a load is already in flight.
    pub fn force_enter_loading(&mut self) -> bool {
        if self.loading {
            return false;
        }
        self.loading = true;
        // A timer from an earlier `ScheduleAfter` may still be pending in
        // the driver's wheel; clearing the flag here means its eventual
        // firing sees `loading == true` and becomes a no-op instead of a
        // second concurrent load (see `on_timer_fire`).
        self.load_pending = false;
        self.exclude_until_ms = None;
        true
    }

    /// `excludePlaylist(durMs)` (spec §4.5): marks this bundle excluded
    /// until `now_ms + duration`.
    pub fn exclude(&mut self, duration: Duration, now_ms: u64) {
        self.exclude_until_ms = Some(now_ms + duration.as_millis() as u64);
    }

    pub fn exclude_until_ms(&self) -> Option<u64> {
        self.exclude_until_ms
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// `isSnapshotValid()` (spec §4.5).
    pub fn is_snapshot_valid(&self, now_ms: u64, timing: &PlaylistTimingConfig) -> bool {
        let Some(snapshot) = &self.snapshot else { return false };
        if snapshot.has_end_tag {
            return true;
        }
        if matches!(snapshot.playlist_type, crate::model::PlaylistKind::Event | crate::model::PlaylistKind::Vod) {
            return true;
        }
        let duration_ms = snapshot.duration_us / 1000;
        let floor_ms = duration_ms.max(timing.snapshot_validity_floor.as_millis() as u64);
        self.last_snapshot_load_ms + floor_ms > now_ms
    }
}

/// Plain reload-URI construction (spec §4.5). No delivery directives are
/// appended unless the previous snapshot's `serverControl` enables them.
fn build_reload_uri(url: &Url, snapshot: Option<&SnapshotData>) -> Url {
    let Some(snapshot) = snapshot else { return url.clone() };
    let sc = &snapshot.server_control;

    if sc.skip_until_us.is_none() && !sc.can_block_reload {
        return url.clone();
    }

    let mut out = url.clone();
    {
        let mut pairs = out.query_pairs_mut();
        if sc.can_block_reload {
            let msn = snapshot.media_sequence + snapshot.segments.len() as u64;
            pairs.append_pair("_HLS_msn", &msn.to_string());

            if snapshot.part_target_duration_us.is_some() {
                let trailing_non_preload = snapshot
                    .trailing_parts
                    .len()
                    .saturating_sub(snapshot.trailing_parts.last().is_some_and(|p| p.is_preload) as usize);
                pairs.append_pair("_HLS_part", &trailing_non_preload.to_string());
            }
        }
        if sc.skip_until_us.is_some() {
            let value = if sc.can_skip_date_ranges { "v2" } else { "YES" };
            pairs.append_pair("_HLS_skip", value);
        }
    }
    out
}

/// Primary-change reload URI (spec §4.5): when a rendition report from the
/// outgoing primary names the new primary's tip.
pub fn primary_change_reload_uri(
    new_primary_url: &Url,
    outgoing_primary_snapshot: Option<&SnapshotData>,
) -> Url {
    let Some(outgoing) = outgoing_primary_snapshot else {
        return new_primary_url.clone();
    };
    if !outgoing.server_control.can_block_reload {
        return new_primary_url.clone();
    }
    let Some(report) = outgoing.rendition_reports.get(new_primary_url) else {
        return new_primary_url.clone();
    };

    let mut out = new_primary_url.clone();
    {
        let mut pairs = out.query_pairs_mut();
        pairs.append_pair("_HLS_msn", &report.last_media_sequence.to_string());
        if let Some(part) = report.last_part_index {
            pairs.append_pair("_HLS_part", &part.to_string());
        }
    }
    out
}

fn next_load_delay_us(snapshot: &SnapshotData, changed: bool) -> u64 {
    let target = snapshot.target_duration_us;
    if !snapshot.server_control.can_block_reload {
        return if changed { target } else { target / 2 };
    }
    if !changed {
        return match snapshot.part_target_duration_us {
            Some(part_target) => part_target / 2,
            None => target / 2,
        };
    }
    0
}
