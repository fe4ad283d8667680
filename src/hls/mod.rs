//! HLS output
//!
//! Per-stream FLV -> MPEG-TS remuxing into a sliding window of segments,
//! with the M3U8/TS retrieval surface over it.

pub mod align;
pub mod audio_cache;
pub mod cache;
pub mod server;
pub mod source;

pub use cache::{SegmentCache, TsItem, MAX_SEGMENTS};
pub use server::HlsService;
pub use source::{HlsSource, SEGMENT_DURATION_MS};
