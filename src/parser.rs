//! Playlist parser factory (spec §6): bytes → typed playlist structures,
//! plus the delta-update (`EXT-X-SKIP`) resolution that needs a previous
//! snapshot to complete.
//!
//! `m3u8-rs` 6.0.0 parses the stable RFC 8216 grammar but has no notion of
//! the low-latency tags (`EXT-X-SERVER-CONTROL`, `EXT-X-PART-INF`,
//! `EXT-X-PART`, `EXT-X-PRELOAD-HINT`, `EXT-X-RENDITION-REPORT`,
//! `EXT-X-SKIP`); every one of them lands in `unknown_tags` as a raw
//! `ExtTag { tag, rest }`. The attribute-list scanner below generalizes the
//! teacher's `PlaylistEngine::parse_playlist_level_map` (its `EXT-X-MAP`
//! workaround in `hls/playlist.rs`) to cover all five.

use std::collections::HashMap;

use url::Url;

use crate::error::TrackerError;
use crate::model::{
    MultivariantPlaylist, PlaylistKind, RenditionReport, SegmentInfo, ServerControl, SnapshotData,
    TrailingPart, VariantDescriptor,
};

/// What a bootstrap fetch (the URI passed to `start(...)`) turned out to
/// be — a real multivariant playlist, or a media playlist addressed
/// directly (spec §4.6: "if the fetched resource is a media playlist,
/// synthesize a single-variant multivariant").
pub enum BootstrapPlaylist {
    Multivariant(MultivariantPlaylist),
    Media { url: Url, snapshot: SnapshotData },
}

/// `createParser()` / `createParser(multivariant, previousSnapshot)` (spec §6).
pub trait PlaylistParser: Send + Sync {
    fn parse_bootstrap(&self, bytes: &[u8], base_url: &Url) -> Result<BootstrapPlaylist, TrackerError>;

    /// `previous` is this same URL's last-known snapshot, consulted only
    /// to resolve an `EXT-X-SKIP` delta update. Raises
    /// [`TrackerError::DeltaUpdateFailed`] if the server sent a delta the
    /// previous snapshot cannot complete.
    fn parse_media_playlist(
        &self,
        bytes: &[u8],
        base_url: &Url,
        previous: Option<&SnapshotData>,
    ) -> Result<SnapshotData, TrackerError>;
}

/// Default parser backed by `m3u8-rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct M3u8Parser;

impl PlaylistParser for M3u8Parser {
    fn parse_bootstrap(&self, bytes: &[u8], base_url: &Url) -> Result<BootstrapPlaylist, TrackerError> {
        match m3u8_rs::parse_playlist_res(bytes) {
            Ok(m3u8_rs::Playlist::MasterPlaylist(master)) => {
                Ok(BootstrapPlaylist::Multivariant(convert_master(&master, base_url)?))
            }
            Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                let snapshot = convert_media_playlist(&media, base_url, None)?;
                Ok(BootstrapPlaylist::Media {
                    url: base_url.clone(),
                    snapshot,
                })
            }
            Err(_) => Err(TrackerError::MalformedManifest {
                url: base_url.to_string(),
                reason: "failed to parse playlist".into(),
            }),
        }
    }

    fn parse_media_playlist(
        &self,
        bytes: &[u8],
        base_url: &Url,
        previous: Option<&SnapshotData>,
    ) -> Result<SnapshotData, TrackerError> {
        match m3u8_rs::parse_playlist_res(bytes) {
            Ok(m3u8_rs::Playlist::MediaPlaylist(media)) => {
                convert_media_playlist(&media, base_url, previous)
            }
            Ok(m3u8_rs::Playlist::MasterPlaylist(_)) => Err(TrackerError::UnexpectedResultType {
                url: base_url.to_string(),
                expected: "media playlist",
                actual: "multivariant playlist",
            }),
            Err(_) => Err(TrackerError::MalformedManifest {
                url: base_url.to_string(),
                reason: "failed to parse playlist".into(),
            }),
        }
    }
}

fn resolve(base: &Url, uri: &str) -> Result<Url, TrackerError> {
    base.join(uri).map_err(|e| TrackerError::InvalidUrl {
        url: uri.to_string(),
        reason: e.to_string(),
    })
}

fn convert_master(master: &m3u8_rs::MasterPlaylist, base_url: &Url) -> Result<MultivariantPlaylist, TrackerError> {
    let mut variants = Vec::with_capacity(master.variants.len());
    let mut media_playlist_urls = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for variant in &master.variants {
        let url = resolve(base_url, &variant.uri)?;
        if seen.insert(url.clone()) {
            media_playlist_urls.push(url.clone());
        }
        variants.push(VariantDescriptor { url });
    }

    for alt in &master.alternatives {
        let Some(uri) = alt.uri.as_deref() else { continue };
        let url = resolve(base_url, uri)?;
        if seen.insert(url.clone()) {
            media_playlist_urls.push(url);
        }
    }

    Ok(MultivariantPlaylist {
        base_uri: base_url.clone(),
        variants,
        media_playlist_urls,
    })
}

fn convert_media_playlist(
    media: &m3u8_rs::MediaPlaylist,
    base_url: &Url,
    previous: Option<&SnapshotData>,
) -> Result<SnapshotData, TrackerError> {
    let playlist_type = match media.playlist_type {
        Some(m3u8_rs::MediaPlaylistType::Vod) => PlaylistKind::Vod,
        Some(m3u8_rs::MediaPlaylistType::Event) => PlaylistKind::Event,
        None => PlaylistKind::Live,
    };

    let server_control = parse_server_control(&media.unknown_tags);
    let part_target_duration_us = parse_part_inf(&media.unknown_tags);

    // `relative_discontinuity_sequence` is a running count of the
    // EXT-X-DISCONTINUITY tags at or before each segment within this
    // playlist (ExoPlayer's `HlsMediaPlaylist.Segment.relativeDiscontinuitySequence`),
    // not a per-segment flag: the reconciler's discontinuity-sequence
    // correction (spec §4.4) adds and subtracts these values across two
    // playlist snapshots, which only works if they're cumulative.
    let mut discontinuity_counter = 0i64;
    let mut segments: Vec<SegmentInfo> = media
        .segments
        .iter()
        .map(|segment| {
            if segment.discontinuity {
                discontinuity_counter += 1;
            }
            SegmentInfo {
                relative_start_time_us: 0, // filled in below by cumulative pass
                duration_us: (segment.duration as f64 * 1_000_000.0).round() as u64,
                relative_discontinuity_sequence: discontinuity_counter,
            }
        })
        .collect();

    let has_program_date_time = media
        .segments
        .first()
        .is_some_and(|s| s.program_date_time.is_some());
    let start_time_us = media
        .segments
        .first()
        .and_then(|s| s.program_date_time.as_ref())
        .map(|pdt| (pdt.timestamp_millis().max(0) as u64) * 1_000)
        .unwrap_or(0);

    let skip = parse_skip(&media.unknown_tags);
    let media_sequence = media.media_sequence;

    if let Some(skipped_segments) = skip {
        let previous = previous.ok_or_else(|| TrackerError::DeltaUpdateFailed {
            url: base_url.to_string(),
            reason: "server sent a delta update (EXT-X-SKIP) but no previous snapshot is known".into(),
        })?;

        let start_idx = media_sequence
            .checked_sub(previous.media_sequence)
            .and_then(|d| usize::try_from(d).ok())
            .ok_or_else(|| TrackerError::DeltaUpdateFailed {
                url: base_url.to_string(),
                reason: "delta update's media sequence precedes the previous snapshot".into(),
            })?;

        let skipped_segments = usize::try_from(skipped_segments).unwrap_or(0);
        let end_idx = start_idx.checked_add(skipped_segments).ok_or_else(|| TrackerError::DeltaUpdateFailed {
            url: base_url.to_string(),
            reason: "skipped-segment count overflowed".into(),
        })?;

        let carried = previous
            .segments
            .get(start_idx..end_idx)
            .ok_or_else(|| TrackerError::DeltaUpdateFailed {
                url: base_url.to_string(),
                reason: "previous snapshot does not retain enough segments to fill the skip gap".into(),
            })?
            .to_vec();

        // The newly-parsed segments' discontinuity counter started at 0;
        // continue it from wherever the carried-over tail of the previous
        // snapshot left off so the whole spliced list stays cumulative.
        let offset = carried.last().map(|s| s.relative_discontinuity_sequence).unwrap_or(0);
        if offset != 0 {
            for segment in segments.iter_mut() {
                segment.relative_discontinuity_sequence += offset;
            }
        }

        segments = carried.into_iter().chain(segments).collect();
    }

    // Recompute cumulative relative start times now that the segment list
    // (possibly spliced with carried-over segments) is final.
    let mut cursor = 0u64;
    for segment in segments.iter_mut() {
        segment.relative_start_time_us = cursor;
        cursor = cursor.saturating_add(segment.duration_us);
    }

    let trailing_parts = parse_trailing_parts(&media.unknown_tags);
    let rendition_reports = parse_rendition_reports(&media.unknown_tags, base_url)?;

    let duration_us = segments.iter().map(|s| s.duration_us).sum::<u64>()
        + trailing_parts.iter().map(|p| p.duration_us).sum::<u64>();

    Ok(SnapshotData {
        media_sequence,
        discontinuity_sequence: media.discontinuity_sequence,
        target_duration_us: (media.target_duration as f64 * 1_000_000.0).round() as u64,
        part_target_duration_us,
        start_time_us,
        duration_us,
        has_end_tag: media.end_list,
        has_program_date_time,
        has_discontinuity_sequence: media.discontinuity_sequence != 0,
        playlist_type,
        segments,
        trailing_parts,
        server_control,
        rendition_reports,
    })
}

/// Splits an HLS attribute-list (`KEY=VALUE,KEY="quoted, value"`) the same
/// way the teacher's `parse_playlist_level_map` does: comma-separated but
/// quote-aware.
fn parse_attribute_list(rest: &str) -> HashMap<String, String> {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }

    let mut map = HashMap::new();
    for part in parts.into_iter().filter(|p| !p.is_empty()) {
        let Some((k, v)) = part.split_once('=') else { continue };
        let key = k.trim().to_ascii_uppercase();
        let mut val = v.trim();
        if let Some(stripped) = val.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            val = stripped;
        }
        map.insert(key, val.to_string());
    }
    map
}

fn find_tag<'a>(tags: &'a [m3u8_rs::ExtTag], name: &str) -> Option<&'a str> {
    tags.iter().find(|t| t.tag == name).and_then(|t| t.rest.as_deref())
}

fn seconds_to_us(value: &str) -> Option<u64> {
    value.parse::<f64>().ok().map(|v| (v * 1_000_000.0).round() as u64)
}

fn parse_server_control(tags: &[m3u8_rs::ExtTag]) -> ServerControl {
    let Some(rest) = find_tag(tags, "X-SERVER-CONTROL") else {
        return ServerControl::default();
    };
    let attrs = parse_attribute_list(rest);
    ServerControl {
        can_block_reload: attrs.get("CAN-BLOCK-RELOAD").is_some_and(|v| v == "YES"),
        can_skip_date_ranges: attrs.get("CAN-SKIP-DATERANGES").is_some_and(|v| v == "YES"),
        skip_until_us: attrs.get("CAN-SKIP-UNTIL").and_then(|v| seconds_to_us(v)),
        hold_back_us: attrs.get("HOLD-BACK").and_then(|v| seconds_to_us(v)),
        part_hold_back_us: attrs.get("PART-HOLD-BACK").and_then(|v| seconds_to_us(v)),
    }
}

fn parse_part_inf(tags: &[m3u8_rs::ExtTag]) -> Option<u64> {
    let rest = find_tag(tags, "X-PART-INF")?;
    let attrs = parse_attribute_list(rest);
    attrs.get("PART-TARGET").and_then(|v| seconds_to_us(v))
}

fn parse_skip(tags: &[m3u8_rs::ExtTag]) -> Option<u64> {
    let rest = find_tag(tags, "X-SKIP")?;
    let attrs = parse_attribute_list(rest);
    attrs.get("SKIPPED-SEGMENTS").and_then(|v| v.parse::<u64>().ok())
}

/// Trailing `EXT-X-PART` entries (after the last full segment) plus an
/// optional trailing `EXT-X-PRELOAD-HINT` for a `TYPE=PART` hint (spec §3:
/// "only the trailing part may be a preload hint").
fn parse_trailing_parts(tags: &[m3u8_rs::ExtTag]) -> Vec<TrailingPart> {
    let mut parts: Vec<TrailingPart> = tags
        .iter()
        .filter(|t| t.tag == "X-PART")
        .filter_map(|t| t.rest.as_deref())
        .map(parse_attribute_list)
        .map(|attrs| TrailingPart {
            is_preload: false,
            duration_us: attrs.get("DURATION").and_then(|v| seconds_to_us(v)).unwrap_or(0),
        })
        .collect();

    let has_preload_hint = tags.iter().any(|t| {
        t.tag == "X-PRELOAD-HINT"
            && t.rest
                .as_deref()
                .map(parse_attribute_list)
                .and_then(|a| a.get("TYPE").cloned())
                .is_some_and(|v| v == "PART")
    });
    if has_preload_hint {
        parts.push(TrailingPart {
            is_preload: true,
            duration_us: 0,
        });
    }
    parts
}

fn parse_rendition_reports(
    tags: &[m3u8_rs::ExtTag],
    base_url: &Url,
) -> Result<HashMap<Url, RenditionReport>, TrackerError> {
    let mut reports = HashMap::new();
    for tag in tags.iter().filter(|t| t.tag == "X-RENDITION-REPORT") {
        let Some(rest) = tag.rest.as_deref() else { continue };
        let attrs = parse_attribute_list(rest);
        let Some(uri) = attrs.get("URI") else { continue };
        let url = resolve(base_url, uri)?;
        let last_media_sequence = attrs.get("LAST-MSN").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let last_part_index = attrs.get("LAST-PART").and_then(|v| v.parse::<u64>().ok());
        reports.insert(
            url,
            RenditionReport {
                last_media_sequence,
                last_part_index,
            },
        );
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000\nlow/index.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=5000000\nhigh/index.m3u8\n";

    const MEDIA: &str = "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:10\n#EXTINF:6.0,\nseg10.ts\n#EXTINF:6.0,\nseg11.ts\n";

    #[test]
    fn parses_master_playlist_variants() {
        let base = Url::parse("https://example.com/master.m3u8").unwrap();
        let parser = M3u8Parser;
        match parser.parse_bootstrap(MASTER.as_bytes(), &base).unwrap() {
            BootstrapPlaylist::Multivariant(mv) => {
                assert_eq!(mv.variants.len(), 2);
                assert_eq!(mv.variants[0].url.as_str(), "https://example.com/low/index.m3u8");
            }
            BootstrapPlaylist::Media { .. } => panic!("expected multivariant"),
        }
    }

    #[test]
    fn parses_media_playlist_bootstrap() {
        let base = Url::parse("https://example.com/media/index.m3u8").unwrap();
        let parser = M3u8Parser;
        match parser.parse_bootstrap(MEDIA.as_bytes(), &base).unwrap() {
            BootstrapPlaylist::Media { snapshot, .. } => {
                assert_eq!(snapshot.media_sequence, 10);
                assert_eq!(snapshot.segments.len(), 2);
            }
            BootstrapPlaylist::Multivariant(_) => panic!("expected media playlist"),
        }
    }

    #[test]
    fn parses_server_control_attributes() {
        let rest = "CAN-BLOCK-RELOAD=YES,CAN-SKIP-UNTIL=12.0,HOLD-BACK=9.0";
        let sc = parse_server_control(&[m3u8_rs::ExtTag {
            tag: "X-SERVER-CONTROL".to_string(),
            rest: Some(rest.to_string()),
        }]);
        assert!(sc.can_block_reload);
        assert_eq!(sc.skip_until_us, Some(12_000_000));
        assert_eq!(sc.hold_back_us, Some(9_000_000));
    }

    #[test]
    fn missing_previous_snapshot_fails_delta_update() {
        let base = Url::parse("https://example.com/media/index.m3u8").unwrap();
        let delta = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:12\n#EXT-X-SKIP:SKIPPED-SEGMENTS=2\n#EXTINF:6.0,\nseg14.ts\n";
        let parser = M3u8Parser;
        let err = parser.parse_media_playlist(delta.as_bytes(), &base, None).unwrap_err();
        assert!(err.is_delta_update_failed());
    }

    #[test]
    fn delta_update_splices_skipped_segments_from_previous() {
        let base = Url::parse("https://example.com/media/index.m3u8").unwrap();
        let parser = M3u8Parser;
        let previous = match m3u8_rs::parse_playlist_res(MEDIA.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MediaPlaylist(pl) => convert_media_playlist(&pl, &base, None).unwrap(),
            _ => unreachable!(),
        };
        assert_eq!(previous.media_sequence, 10);

        let delta = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:10\n#EXT-X-SKIP:SKIPPED-SEGMENTS=1\n#EXTINF:6.0,\nseg11.ts\n#EXTINF:6.0,\nseg12.ts\n";
        let snapshot = parser.parse_media_playlist(delta.as_bytes(), &base, Some(&previous)).unwrap();
        assert_eq!(snapshot.segments.len(), 3);
    }

    #[test]
    fn relative_discontinuity_sequence_is_cumulative() {
        let base = Url::parse("https://example.com/media/index.m3u8").unwrap();
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:10\n\
            #EXTINF:6.0,\nseg10.ts\n\
            #EXT-X-DISCONTINUITY\n#EXTINF:6.0,\nseg11.ts\n\
            #EXTINF:6.0,\nseg12.ts\n\
            #EXT-X-DISCONTINUITY\n#EXTINF:6.0,\nseg13.ts\n";
        let snapshot = match m3u8_rs::parse_playlist_res(media.as_bytes()).unwrap() {
            m3u8_rs::Playlist::MediaPlaylist(pl) => convert_media_playlist(&pl, &base, None).unwrap(),
            _ => unreachable!(),
        };
        let counts: Vec<i64> = snapshot.segments.iter().map(|s| s.relative_discontinuity_sequence).collect();
        assert_eq!(counts, vec![0, 1, 1, 2]);
    }
}
