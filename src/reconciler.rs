//! Snapshot Reconciler (C4, spec §4.4).
//!
//! Stateless, side-effect-free: the target of the crate's property tests
//! (spec §8, "Reconciler purity").

use crate::model::{Snapshot, SnapshotData};

/// `reconcile(old?, loaded, primary?) -> newSnapshot` (spec.md §4.4).
///
/// `loaded` is always a freshly-parsed snapshot (never yet exposed to a
/// caller), so it is safe to turn it into the returned [`Snapshot`]'s Arc
/// directly when it is newer.
pub fn reconcile(old: Option<&Snapshot>, loaded: SnapshotData, primary: Option<&Snapshot>) -> Snapshot {
    let old_data = old.map(|s| s.as_ref());

    if !loaded.is_newer_than(old_data) {
        return match (loaded.has_end_tag, old) {
            // Server appended an end-tag without advancing mediaSequence:
            // a documented compensation for non-conforming servers (spec §9).
            (true, Some(old)) => old.copy_with_end_tag(),
            (true, None) => std::sync::Arc::new(loaded),
            (false, Some(old)) => old.clone(),
            (false, None) => std::sync::Arc::new(loaded),
        };
    }

    let start_time_us = compute_start_time_us(old_data, &loaded, primary);
    let discontinuity_sequence = compute_discontinuity_sequence(old_data, &loaded, primary);

    loaded.copy_with(start_time_us, discontinuity_sequence)
    // `copy_with` allocates a fresh Arc even when the numbers happen to
    // match the loaded values; that is intentional; this path is only
    // reached when `loaded` is newer, so the previous `old` Arc must not
    // be reused.
}

fn compute_start_time_us(
    old: Option<&SnapshotData>,
    loaded: &SnapshotData,
    primary: Option<&Snapshot>,
) -> u64 {
    if loaded.has_program_date_time {
        return loaded.start_time_us;
    }

    let Some(old) = old else {
        return primary.map(|p| p.start_time_us).unwrap_or(0);
    };

    if let Some(overlap) = first_overlap(old, loaded) {
        return old.start_time_us.saturating_add(overlap.relative_start_time_us);
    }

    if abuts_exactly(old, loaded) {
        return old.end_time_us();
    }

    primary.map(|p| p.start_time_us).unwrap_or(0)
}

fn compute_discontinuity_sequence(
    old: Option<&SnapshotData>,
    loaded: &SnapshotData,
    primary: Option<&Snapshot>,
) -> u32 {
    if loaded.has_discontinuity_sequence {
        return loaded.discontinuity_sequence;
    }

    let Some(old) = old else {
        return primary.map(|p| p.discontinuity_sequence).unwrap_or(0);
    };

    if let Some(overlap) = first_overlap(old, loaded) {
        // TODO: improve cross-playlist discontinuity adjustment when the
        // arithmetic below underflows or the two playlists disagree about
        // discontinuity bookkeeping; preserved as-is from the source
        // algorithm per spec.md §9's open question.
        let loaded_first = loaded
            .segments
            .first()
            .map(|s| s.relative_discontinuity_sequence)
            .unwrap_or(0);
        let adjusted = old.discontinuity_sequence as i64
            + overlap.relative_discontinuity_sequence
            - loaded_first;
        return adjusted.max(0) as u32;
    }

    // No overlap and no program-date-time: inherit from primary. This is
    // the imperfect fallback spec.md §9 calls out explicitly.
    primary.map(|p| p.discontinuity_sequence).unwrap_or(0)
}

/// `old.segments[loaded.mediaSequence - old.mediaSequence]`, if that index
/// is in bounds (spec.md §4.4 step 2).
fn first_overlap<'a>(
    old: &'a SnapshotData,
    loaded: &SnapshotData,
) -> Option<&'a crate::model::SegmentInfo> {
    let delta = loaded.media_sequence.checked_sub(old.media_sequence)?;
    let idx = usize::try_from(delta).ok()?;
    old.segments.get(idx)
}

/// `old.segmentCount == loaded.mediaSequence - old.mediaSequence` (spec.md
/// §4.4 step 2, the "exact abut, no overlap" branch).
fn abuts_exactly(old: &SnapshotData, loaded: &SnapshotData) -> bool {
    match loaded.media_sequence.checked_sub(old.media_sequence) {
        Some(delta) => usize::try_from(delta).is_ok_and(|delta| delta == old.segments.len()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PlaylistKind, RenditionReport, SegmentInfo, ServerControl};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn snap(media_sequence: u64, segments: Vec<SegmentInfo>) -> SnapshotData {
        SnapshotData {
            media_sequence,
            discontinuity_sequence: 0,
            target_duration_us: 6_000_000,
            part_target_duration_us: None,
            start_time_us: 0,
            duration_us: segments.iter().map(|s| s.duration_us).sum(),
            has_end_tag: false,
            has_program_date_time: false,
            has_discontinuity_sequence: false,
            playlist_type: PlaylistKind::Live,
            segments,
            trailing_parts: vec![],
            server_control: ServerControl::default(),
            rendition_reports: HashMap::new(),
        }
    }

    fn seg(start: u64, dur: u64) -> SegmentInfo {
        SegmentInfo {
            relative_start_time_us: start,
            duration_us: dur,
            relative_discontinuity_sequence: 0,
        }
    }

    #[test]
    fn first_load_with_no_primary_starts_at_zero() {
        let loaded = snap(0, vec![seg(0, 10_000_000), seg(10_000_000, 10_000_000)]);
        let result = reconcile(None, loaded, None);
        assert_eq!(result.start_time_us, 0);
        assert_eq!(result.discontinuity_sequence, 0);
    }

    #[test]
    fn first_load_with_program_date_time_uses_its_own_start() {
        let mut loaded = snap(0, vec![seg(0, 10_000_000)]);
        loaded.has_program_date_time = true;
        loaded.start_time_us = 1_700_000_000_000_000;
        let result = reconcile(None, loaded.clone(), None);
        assert_eq!(result.start_time_us, 1_700_000_000_000_000);
    }

    #[test]
    fn unchanged_snapshot_returns_same_reference() {
        let old: Snapshot = Arc::new(snap(10, vec![seg(0, 5_000_000)]));
        let reloaded = (*old).clone();
        let result = reconcile(Some(&old), reloaded, None);
        assert!(Arc::ptr_eq(&old, &result));
    }

    #[test]
    fn unchanged_snapshot_with_new_end_tag_copies_old_with_end_tag() {
        let old: Snapshot = Arc::new(snap(10, vec![seg(0, 5_000_000)]));
        let mut reloaded = (*old).clone();
        reloaded.has_end_tag = true;
        let result = reconcile(Some(&old), reloaded, None);
        assert!(!Arc::ptr_eq(&old, &result));
        assert!(result.has_end_tag);
        assert_eq!(result.media_sequence, old.media_sequence);
    }

    #[test]
    fn overlapping_reload_anchors_start_time_on_shared_segment() {
        let old: Snapshot = Arc::new({
            let mut s = snap(0, vec![seg(0, 10_000_000), seg(10_000_000, 10_000_000), seg(20_000_000, 10_000_000)]);
            s.start_time_us = 100_000;
            s
        });
        // New playlist dropped the first segment (mediaSequence advanced by 1)
        // and appended a new one; segment[0] of loaded overlaps old.segments[1].
        let loaded = snap(1, vec![seg(0, 10_000_000), seg(10_000_000, 10_000_000), seg(20_000_000, 10_000_000)]);
        let result = reconcile(Some(&old), loaded, None);
        assert_eq!(result.start_time_us, 100_000 + 10_000_000);
    }

    #[test]
    fn exact_abut_anchors_on_old_end_time() {
        let old: Snapshot = Arc::new({
            let mut s = snap(0, vec![seg(0, 10_000_000), seg(10_000_000, 10_000_000)]);
            s.start_time_us = 0;
            s
        });
        // loaded.mediaSequence - old.mediaSequence == old.segments.len(): no overlap,
        // but the playlists abut exactly.
        let loaded = snap(2, vec![seg(0, 10_000_000)]);
        let result = reconcile(Some(&old), loaded, None);
        assert_eq!(result.start_time_us, old.end_time_us());
    }

    #[test]
    fn gap_with_no_overlap_falls_back_to_primary() {
        let old: Snapshot = Arc::new(snap(0, vec![seg(0, 10_000_000)]));
        let primary: Snapshot = Arc::new({
            let mut p = snap(500, vec![seg(0, 10_000_000)]);
            p.start_time_us = 987_654;
            p.discontinuity_sequence = 3;
            p
        });
        // Big jump in mediaSequence with no overlap and no abut.
        let loaded = snap(999, vec![seg(0, 10_000_000)]);
        let result = reconcile(Some(&old), loaded, Some(&primary));
        assert_eq!(result.start_time_us, 987_654);
        assert_eq!(result.discontinuity_sequence, 3);
    }

    #[test]
    fn explicit_discontinuity_sequence_wins_over_inheritance() {
        let old: Snapshot = Arc::new(snap(0, vec![seg(0, 10_000_000)]));
        let mut loaded = snap(1, vec![seg(0, 10_000_000)]);
        loaded.has_discontinuity_sequence = true;
        loaded.discontinuity_sequence = 9;
        let result = reconcile(Some(&old), loaded, None);
        assert_eq!(result.discontinuity_sequence, 9);
    }

    #[test]
    fn reconcile_is_pure() {
        let old: Snapshot = Arc::new(snap(0, vec![seg(0, 10_000_000)]));
        let primary: Snapshot = Arc::new(snap(0, vec![seg(0, 10_000_000)]));
        let loaded1 = snap(1, vec![seg(0, 10_000_000), seg(10_000_000, 5_000_000)]);
        let loaded2 = loaded1.clone();
        let r1 = reconcile(Some(&old), loaded1, Some(&primary));
        let r2 = reconcile(Some(&old), loaded2, Some(&primary));
        assert_eq!(r1.start_time_us, r2.start_time_us);
        assert_eq!(r1.discontinuity_sequence, r2.discontinuity_sequence);
        assert_eq!(r1.media_sequence, r2.media_sequence);
    }
}
