//! Listener Fan-out (C7, spec §4.7) and the external observer traits
//! (spec §6). Dispatch is synchronous on the driver (spec §5): no
//! listener method may block or perform I/O.

use crate::error::TrackerError;
use crate::model::Snapshot;
use crate::retry::{FallbackOptions, FallbackSelection, RetryPolicy};
use url::Url;

/// Error context handed to [`PlaylistEventListener::on_playlist_error`]
/// (spec §4.5/§7).
#[derive(Debug, Clone)]
pub struct PlaylistErrorInfo {
    pub url: Url,
    pub error: TrackerError,
}

/// Observer of primary-variant snapshot changes (spec §4.6, §6).
pub trait PrimaryPlaylistListener: Send + Sync {
    fn on_primary_playlist_refreshed(&self, snapshot: &Snapshot);
}

/// General playlist observer (spec §6). `on_playlist_error` returns
/// whether the listener declined to exclude the offending bundle — the
/// tracker excludes only when *every* listener declines is false for at
/// least one, matching `notifyPlaylistError`'s "any listener declined to
/// exclude" semantics (spec §4.6).
pub trait PlaylistEventListener: Send + Sync {
    fn on_playlist_changed(&self);

    /// Returns `true` if this listener declined to exclude the bundle
    /// (i.e. it wants the tracker to treat the variant as still usable).
    fn on_playlist_error(&self, info: &PlaylistErrorInfo, force_retry: bool) -> bool;
}

/// The bootstrap listener's decision: exclude the offending URL for a
/// duration, or do nothing (spec §4.7).
pub struct FirstPrimaryDecision {
    pub exclude_for: Option<std::time::Duration>,
}

/// Logic for the transient first-primary-snapshot listener (spec §4.7):
/// auto-registered at `start(...)`, removed on the first `onPlaylistChanged`.
/// Implemented as a free function rather than a trait object because its
/// only state is "how many variants are currently excluded," which the
/// tracker already owns — giving it a back-reference into the tracker
/// would recreate the cyclic-object-graph problem spec.md §9 calls out.
///
/// Always "never declines to exclude" in spec terms: callers of this
/// function drive `on_playlist_error`'s return value independently and
/// should treat this listener as declining nothing.
pub fn first_primary_fallback_decision(
    retry_policy: &dyn RetryPolicy,
    error: &TrackerError,
    total_variants: u32,
    excluded_variants: u32,
) -> FirstPrimaryDecision {
    let options = FallbackOptions {
        total_locations: 1,
        excluded_locations: 0,
        total_tracks: total_variants,
        excluded_tracks: excluded_variants,
    };
    match retry_policy.fallback_selection(options, error) {
        Some(FallbackSelection::Track { exclusion_duration }) => FirstPrimaryDecision {
            exclude_for: Some(exclusion_duration),
        },
        _ => FirstPrimaryDecision { exclude_for: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::retry::DefaultRetryPolicy;

    #[test]
    fn first_primary_excludes_when_fallback_available() {
        let policy = DefaultRetryPolicy::new(RetryConfig::default());
        let error = TrackerError::HttpStatus {
            status: 503,
            url: "https://example.com/a.m3u8".into(),
        };
        let decision = first_primary_fallback_decision(&policy, &error, 2, 0);
        assert!(decision.exclude_for.is_some());
    }

    #[test]
    fn first_primary_declines_when_no_variants_remain() {
        let policy = DefaultRetryPolicy::new(RetryConfig::default());
        let error = TrackerError::HttpStatus {
            status: 503,
            url: "https://example.com/a.m3u8".into(),
        };
        let decision = first_primary_fallback_decision(&policy, &error, 2, 1);
        assert!(decision.exclude_for.is_none());
    }
}
