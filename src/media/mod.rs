//! Media parsing
//!
//! FLV tag header classification plus the two bitstream transforms the
//! TS path needs: AAC raw -> ADTS and H.264 AVCC -> Annex-B.

pub mod aac;
pub mod flv;
pub mod h264;

pub use aac::{AacConfig, AdtsWriter};
pub use flv::{AudioTagHeader, VideoTagHeader};
pub use h264::{AnnexBConverter, AvcConfig, NaluIterator, NaluType};
