//! HLS live-playlist tracking core: multivariant bootstrap, per-variant
//! reload scheduling, delta-update (`EXT-X-SKIP`) reconciliation, and
//! low-latency delivery-directive reload URIs per RFC 8216 §6.2.5.
//!
//! The crate has no opinion on how bytes get turned into playback — it
//! tracks playlist *state*: what segments exist, when the next reload is
//! due, which variant is primary, and when a variant should be excluded
//! after repeated failures. A caller drives [`tracker::PlaylistTracker::run`]
//! on a single task and reads snapshots back out with
//! [`tracker::PlaylistTracker::get_playlist_snapshot`].

pub mod bundle;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod listener;
pub mod loader;
pub mod model;
pub mod parser;
pub mod reconciler;
pub mod retry;
pub mod source;
pub mod tracker;

pub use config::{DataType, PlaylistTimingConfig, RetryConfig, TrackerConfig};
pub use error::{Result, TrackerError};
pub use model::{
    MultivariantPlaylist, PlaylistKind, RenditionReport, SegmentInfo, ServerControl, Snapshot,
    SnapshotData, TrailingPart, VariantDescriptor,
};
pub use tracker::PlaylistTracker;
