//! Configuration for the tracker, layered the way the teacher's
//! `HlsConfig` aggregates per-concern sub-configs (see `hls/config.rs`).

use std::time::Duration;

/// Data-type classification used by the retry policy (spec §4.3, §6 Defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// The multivariant (master) playlist, fetched exactly once per `start`.
    Manifest,
    /// A media (variant or alternate-rendition) playlist reload.
    MediaPlaylist,
}

/// Top-level tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub retry: RetryConfig,
    pub playlist: PlaylistTimingConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            playlist: PlaylistTimingConfig::default(),
        }
    }
}

/// Backoff parameters for the default retry policy (grounded on the
/// teacher's `hls::retry::RetryPolicy`).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Minimum retry count required before a data type's load is allowed
    /// to give up; the manifest class gets more patience than a routine
    /// media-playlist reload (spec §6: "First multivariant load uses the
    /// policy's min-retry for the manifest class").
    pub min_retries_manifest: u32,
    pub min_retries_media_playlist: u32,
    /// Base delay for exponential backoff. Actual delay = base * 2^attempt,
    /// capped at `max_delay`, with optional jitter.
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_retries_manifest: 3,
            min_retries_media_playlist: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            jitter: true,
        }
    }
}

/// Timing constants used by the bundle state machine (spec §4.5, §6 Defaults).
#[derive(Debug, Clone)]
pub struct PlaylistTimingConfig {
    /// Multiplier applied to `targetDuration` to decide a live playlist is
    /// stuck (spec §4.5, default 3.5).
    pub stuck_coefficient: f64,
    /// Floor for `isSnapshotValid` (spec §4.5, default 30_000 ms).
    pub snapshot_validity_floor: Duration,
    /// Timeout applied to a single playlist fetch (not part of spec.md;
    /// ambient stack addition mirroring `initial_playlist_fetch_timeout`
    /// in the teacher's `HlsPlaylistConfig`).
    pub fetch_timeout: Duration,
}

impl Default for PlaylistTimingConfig {
    fn default() -> Self {
        Self {
            stuck_coefficient: 3.5,
            snapshot_validity_floor: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(15),
        }
    }
}
