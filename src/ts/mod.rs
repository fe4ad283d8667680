//! MPEG-TS output
//!
//! Wire-exact transport stream emission: PES packetisation, PAT/PMT with
//! MPEG-2 CRC32, PCR insertion at keyframes, continuity counters.

pub mod crc32;
pub mod muxer;

pub use crc32::mpeg_crc32;
pub use muxer::{TsMuxer, AUDIO_PID, PAT_PID, PMT_PID, TICKS_PER_MS, TS_PACKET_LEN, VIDEO_PID};
