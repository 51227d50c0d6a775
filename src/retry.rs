//! Retry/Exclusion Policy (C3, spec §4.3).
//!
//! The backoff arithmetic in [`DefaultRetryPolicy`] is lifted close to
//! verbatim from the teacher's `hls::retry::RetryPolicy::delay_for_attempt`
//! (checked-shift exponential growth, capped jitter); what changes is the
//! surrounding contract, which here is the spec's `RetryDecision`/
//! `FallbackSelection` shape rather than a generic `retry_with_backoff`
//! driver loop (the loader, not this policy, owns the attempt loop).

use std::time::Duration;

use rand::Rng;

use crate::config::{DataType, RetryConfig};
use crate::error::TrackerError;

/// What a bundle or loader should do after an error (spec §4.2, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after this delay; `reset_error_count` clears the bundle's
    /// accumulated error streak (used after a directive-forced reload).
    RetryAfter {
        delay: Duration,
        reset_error_count: bool,
    },
    /// Give up on this attempt but the bundle is not in a fatal state.
    DontRetry,
    /// Fatal: surfaced via `maybeThrowPrimaryPlaylistRefreshError`.
    DontRetryFatal,
}

/// Inputs to [`RetryPolicy::fallback_selection`] (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub struct FallbackOptions {
    pub total_locations: u32,
    pub excluded_locations: u32,
    pub total_tracks: u32,
    pub excluded_tracks: u32,
}

/// What the policy recommends excluding, if anything (spec §4.3). The
/// tracker only ever acts on `Track` (location fallback is out of scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackSelection {
    Track { exclusion_duration: Duration },
    Location { exclusion_duration: Duration },
}

/// Strategy object consulted by the loader and bundle on error (spec §4.3).
/// Pure: no I/O, no mutation of tracker state — callers act on its answers.
pub trait RetryPolicy: Send + Sync {
    /// Minimum retry count required before a `data_type`'s load is allowed
    /// to reach a fatal decision.
    fn min_retry_count(&self, data_type: DataType) -> u32;

    /// Called once per error with the 0-indexed error count accumulated so
    /// far for the current load attempt.
    fn on_error(&self, data_type: DataType, error: &TrackerError, error_count: u32) -> RetryDecision;

    /// `getFallbackSelection` (spec §4.3): asked by the first-primary
    /// listener, and by ordinary error handling once listeners decline to
    /// exclude on their own.
    fn fallback_selection(
        &self,
        options: FallbackOptions,
        error: &TrackerError,
    ) -> Option<FallbackSelection>;
}

/// Exponential backoff with capped jitter, directly adapted from the
/// teacher's segment-fetch retry policy.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
    default_exclusion_duration: Duration,
}

impl DefaultRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            default_exclusion_duration: Duration::from_secs(30),
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`, with optional jitter in
    /// `[0, base/2)` limited so the result never exceeds `max_delay`.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let exp_delay = self
            .config
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.config.max_delay);
        let capped = exp_delay.min(self.config.max_delay);

        if !self.config.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.config.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range_ms == 0 {
            return capped;
        }

        let remaining_ms =
            u64::try_from(self.config.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.config.max_delay)
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn min_retry_count(&self, data_type: DataType) -> u32 {
        match data_type {
            DataType::Manifest => self.config.min_retries_manifest,
            DataType::MediaPlaylist => self.config.min_retries_media_playlist,
        }
    }

    fn on_error(&self, data_type: DataType, error: &TrackerError, error_count: u32) -> RetryDecision {
        if !is_retryable(error) {
            return RetryDecision::DontRetryFatal;
        }

        if error_count >= self.min_retry_count(data_type) {
            return RetryDecision::DontRetryFatal;
        }

        RetryDecision::RetryAfter {
            delay: self.delay_for_attempt(error_count),
            reset_error_count: false,
        }
    }

    fn fallback_selection(
        &self,
        options: FallbackOptions,
        error: &TrackerError,
    ) -> Option<FallbackSelection> {
        if !is_retryable(error) {
            return None;
        }
        if options.excluded_tracks + 1 >= options.total_tracks {
            // Excluding one more would leave nothing to fall back to.
            return None;
        }
        Some(FallbackSelection::Track {
            exclusion_duration: self.default_exclusion_duration,
        })
    }
}

/// Network errors and 5xx-class HTTP statuses are retryable; malformed
/// manifests and 4xx statuses (other than the blocking-reload rejections
/// handled upstream in the bundle, spec §4.5) are not.
fn is_retryable(error: &TrackerError) -> bool {
    match error {
        TrackerError::Network { .. } => true,
        TrackerError::HttpStatus { status, .. } => *status >= 500,
        TrackerError::Cancelled => false,
        TrackerError::InvalidUrl { .. } => false,
        TrackerError::MalformedManifest { .. } => false,
        TrackerError::DeltaUpdateFailed { .. } => false,
        TrackerError::UnexpectedResultType { .. } => false,
        TrackerError::Internal { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new(RetryConfig {
            min_retries_manifest: 3,
            min_retries_media_playlist: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        })
    }

    fn network_error() -> TrackerError {
        TrackerError::HttpStatus {
            status: 503,
            url: "http://example.com/a.m3u8".into(),
        }
    }

    #[test]
    fn delay_without_jitter_is_deterministic() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_respects_max_cap() {
        let p = policy();
        assert_eq!(p.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn non_retryable_error_is_fatal_immediately() {
        let p = policy();
        let err = TrackerError::MalformedManifest {
            url: "http://example.com/a.m3u8".into(),
            reason: "unparsable".into(),
        };
        assert_eq!(p.on_error(DataType::MediaPlaylist, &err, 0), RetryDecision::DontRetryFatal);
    }

    #[test]
    fn retryable_error_retries_with_backoff() {
        let p = policy();
        let decision = p.on_error(DataType::MediaPlaylist, &network_error(), 0);
        assert_eq!(
            decision,
            RetryDecision::RetryAfter {
                delay: Duration::from_millis(100),
                reset_error_count: false,
            }
        );
    }

    #[test]
    fn fallback_declines_when_it_would_exhaust_all_tracks() {
        let p = policy();
        let options = FallbackOptions {
            total_locations: 1,
            excluded_locations: 0,
            total_tracks: 2,
            excluded_tracks: 1,
        };
        assert_eq!(p.fallback_selection(options, &network_error()), None);
    }

    #[test]
    fn fallback_excludes_track_when_alternatives_remain() {
        let p = policy();
        let options = FallbackOptions {
            total_locations: 1,
            excluded_locations: 0,
            total_tracks: 2,
            excluded_tracks: 0,
        };
        assert_eq!(
            p.fallback_selection(options, &network_error()),
            Some(FallbackSelection::Track {
                exclusion_duration: Duration::from_secs(30)
            })
        );
    }
}
