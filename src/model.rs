//! Playlist data model (spec §3).
//!
//! Snapshots are immutable and shared by reference: [`Snapshot`] is an
//! `Arc<SnapshotData>`, so "did the reconciler produce a new snapshot or
//! hand back the old one" is answered with `Arc::ptr_eq`, exactly as
//! spec.md §4.5 describes ("newSnapshot != oldSnapshot (reference
//! inequality, which means loaded was newer)").

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

/// `EXT-X-PLAYLIST-TYPE` value, or its absence (ordinary live playlist).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Event,
    Vod,
    Live,
}

/// One entry of `segments` in a media playlist snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub relative_start_time_us: u64,
    pub duration_us: u64,
    pub relative_discontinuity_sequence: i64,
}

/// One low-latency "part" trailing the last full segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingPart {
    pub is_preload: bool,
    pub duration_us: u64,
}

/// `EXT-X-SERVER-CONTROL` attributes. Every time field may be unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerControl {
    pub can_block_reload: bool,
    pub can_skip_date_ranges: bool,
    pub skip_until_us: Option<u64>,
    pub hold_back_us: Option<u64>,
    pub part_hold_back_us: Option<u64>,
}

/// One entry of `EXT-X-RENDITION-REPORT`: a peer playlist's last-known tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenditionReport {
    pub last_media_sequence: u64,
    pub last_part_index: Option<u64>,
}

/// An immutable, parsed media playlist plus derived timing.
///
/// Always accessed through [`Snapshot`] (an `Arc` of this type) so identity
/// comparisons are cheap and meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotData {
    pub media_sequence: u64,
    pub discontinuity_sequence: u32,
    pub target_duration_us: u64,
    pub part_target_duration_us: Option<u64>,
    pub start_time_us: u64,
    pub duration_us: u64,
    pub has_end_tag: bool,
    pub has_program_date_time: bool,
    pub has_discontinuity_sequence: bool,
    pub playlist_type: PlaylistKind,
    pub segments: Vec<SegmentInfo>,
    pub trailing_parts: Vec<TrailingPart>,
    pub server_control: ServerControl,
    pub rendition_reports: HashMap<Url, RenditionReport>,
}

/// Shared handle to an immutable snapshot. Cloning is an `Arc` clone.
pub type Snapshot = Arc<SnapshotData>;

impl SnapshotData {
    /// `old.endTimeUs` in spec.md §4.4: the end of the last segment.
    pub fn end_time_us(&self) -> u64 {
        match self.segments.last() {
            Some(last) => self
                .start_time_us
                .saturating_add(last.relative_start_time_us)
                .saturating_add(last.duration_us),
            None => self.start_time_us,
        }
    }

    /// `copyWith(startTimeUs, discontinuitySequence)` (spec.md §3): a new
    /// snapshot with those two derived fields overridden.
    pub fn copy_with(&self, start_time_us: u64, discontinuity_sequence: u32) -> Snapshot {
        Arc::new(SnapshotData {
            start_time_us,
            discontinuity_sequence,
            ..self.clone()
        })
    }

    /// `copyWithEndTag()` (spec.md §3): same snapshot, `hasEndTag = true`.
    pub fn copy_with_end_tag(&self) -> Snapshot {
        Arc::new(SnapshotData {
            has_end_tag: true,
            ..self.clone()
        })
    }

    /// `isNewerThan(other)` (spec.md §3): mediaSequence, then segment
    /// count, then trailing-parts count. A `None` `other` (first load for
    /// this URL) is always older.
    pub fn is_newer_than(&self, other: Option<&SnapshotData>) -> bool {
        let Some(other) = other else {
            return true;
        };
        if self.media_sequence != other.media_sequence {
            return self.media_sequence > other.media_sequence;
        }
        if self.segments.len() != other.segments.len() {
            return self.segments.len() > other.segments.len();
        }
        self.trailing_parts.len() > other.trailing_parts.len()
    }
}

/// One entry of the multivariant playlist's `variants` list. Ordering
/// defines fallback priority (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantDescriptor {
    pub url: Url,
}

/// A parsed multivariant (master) playlist, immutable once loaded.
#[derive(Debug, Clone)]
pub struct MultivariantPlaylist {
    pub base_uri: Url,
    pub variants: Vec<VariantDescriptor>,
    /// All media-playlist URIs (variants + alternate renditions), in
    /// first-seen order, deduplicated.
    pub media_playlist_urls: Vec<Url>,
}

impl MultivariantPlaylist {
    /// A single-variant multivariant synthesized when `start(...)`'s URI
    /// turns out to address a media playlist directly (spec.md §4.6).
    pub fn single_variant(url: Url) -> Self {
        Self {
            base_uri: url.clone(),
            variants: vec![VariantDescriptor { url: url.clone() }],
            media_playlist_urls: vec![url],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_snapshot(media_sequence: u64, segment_count: usize, part_count: usize) -> SnapshotData {
        SnapshotData {
            media_sequence,
            discontinuity_sequence: 0,
            target_duration_us: 6_000_000,
            part_target_duration_us: None,
            start_time_us: 0,
            duration_us: 0,
            has_end_tag: false,
            has_program_date_time: false,
            has_discontinuity_sequence: false,
            playlist_type: PlaylistKind::Live,
            segments: vec![
                SegmentInfo {
                    relative_start_time_us: 0,
                    duration_us: 0,
                    relative_discontinuity_sequence: 0,
                };
                segment_count
            ],
            trailing_parts: vec![
                TrailingPart {
                    is_preload: false,
                    duration_us: 0
                };
                part_count
            ],
            server_control: ServerControl::default(),
            rendition_reports: HashMap::new(),
        }
    }

    #[test]
    fn newer_when_no_prior_snapshot() {
        let s = empty_snapshot(5, 1, 0);
        assert!(s.is_newer_than(None));
    }

    #[test]
    fn newer_by_media_sequence() {
        let old = empty_snapshot(5, 3, 0);
        let new = empty_snapshot(6, 1, 0);
        assert!(new.is_newer_than(Some(&old)));
        assert!(!old.is_newer_than(Some(&new)));
    }

    #[test]
    fn newer_by_segment_count_when_sequence_ties() {
        let old = empty_snapshot(5, 3, 0);
        let new = empty_snapshot(5, 4, 0);
        assert!(new.is_newer_than(Some(&old)));
        assert!(!old.is_newer_than(Some(&new)));
    }

    #[test]
    fn newer_by_trailing_parts_when_everything_else_ties() {
        let old = empty_snapshot(5, 3, 1);
        let new = empty_snapshot(5, 3, 2);
        assert!(new.is_newer_than(Some(&old)));
        assert!(!old.is_newer_than(Some(&new)));
    }

    #[test]
    fn copy_with_preserves_identity_semantics() {
        let original = Arc::new(empty_snapshot(5, 3, 0));
        let copy = original.copy_with(42, 7);
        assert_eq!(copy.start_time_us, 42);
        assert_eq!(copy.discontinuity_sequence, 7);
        assert!(!Arc::ptr_eq(&original, &copy));
    }

    #[test]
    fn copy_with_end_tag_sets_flag_only() {
        let original = Arc::new(empty_snapshot(5, 3, 0));
        let copy = original.copy_with_end_tag();
        assert!(copy.has_end_tag);
        assert_eq!(copy.media_sequence, original.media_sequence);
    }

    #[test]
    fn end_time_sums_start_and_last_segment() {
        let mut snap = empty_snapshot(0, 0, 0);
        snap.start_time_us = 1_000;
        snap.segments.push(SegmentInfo {
            relative_start_time_us: 2_000,
            duration_us: 500,
            relative_discontinuity_sequence: 0,
        });
        assert_eq!(snap.end_time_us(), 3_500);
    }
}
