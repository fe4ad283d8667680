//! FLV media tag headers
//!
//! RTMP audio/video messages are FLV tag bodies. The leading bytes carry
//! the codec classification this server routes on:
//!
//! ```text
//! Audio: | soundFormat(4) | soundRate(2) | soundSize(1) | soundType(1) |
//!        [ aacPacketType(1) when soundFormat == AAC ]
//! Video: | frameType(4) | codecId(4) |
//!        [ avcPacketType(1) + compositionTime(3, signed) for key/inter ]
//! ```

use crate::error::MediaError;

// Frame types (video, upper nibble)
pub const FRAME_KEY: u8 = 1;
pub const FRAME_INTER: u8 = 2;

// Video codec ids (lower nibble)
pub const CODEC_H264: u8 = 7;

// Audio sound formats (upper nibble)
pub const SOUND_MP3: u8 = 2;
pub const SOUND_AAC: u8 = 10;
pub const SOUND_MP3_8K: u8 = 14;

// AAC packet types
pub const AAC_SEQ_HEADER: u8 = 0;
pub const AAC_RAW: u8 = 1;

// AVC packet types
pub const AVC_SEQ_HEADER: u8 = 0;
pub const AVC_NALU: u8 = 1;
pub const AVC_END_OF_SEQ: u8 = 2;

/// Parsed audio tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioTagHeader {
    pub sound_format: u8,
    /// Sample rate index: 0=5.5k 1=11k 2=22k 3=44k (AAC always 3)
    pub sound_rate: u8,
    /// 0 = 8-bit, 1 = 16-bit
    pub sound_size: u8,
    /// 0 = mono, 1 = stereo
    pub sound_type: u8,
    /// Only meaningful when `sound_format == SOUND_AAC`
    pub aac_packet_type: u8,
}

impl AudioTagHeader {
    /// Parse the leading bytes of an audio tag body; returns the header and
    /// the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), MediaError> {
        if data.is_empty() {
            return Err(MediaError::InvalidAudioTag);
        }

        let flags = data[0];
        let mut header = AudioTagHeader {
            sound_format: flags >> 4,
            sound_rate: (flags >> 2) & 0x3,
            sound_size: (flags >> 1) & 0x1,
            sound_type: flags & 0x1,
            aac_packet_type: 0,
        };

        let mut n = 1;
        if header.sound_format == SOUND_AAC {
            if data.len() < 2 {
                return Err(MediaError::InvalidAudioTag);
            }
            header.aac_packet_type = data[1];
            n += 1;
        }

        Ok((header, n))
    }

    pub fn is_aac(&self) -> bool {
        self.sound_format == SOUND_AAC
    }

    pub fn is_seq_header(&self) -> bool {
        self.sound_format == SOUND_AAC && self.aac_packet_type == AAC_SEQ_HEADER
    }
}

/// Parsed video tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoTagHeader {
    pub frame_type: u8,
    pub codec_id: u8,
    pub avc_packet_type: u8,
    /// Signed composition-time offset, sign-extended from 24 bits
    pub composition_time: i32,
}

impl VideoTagHeader {
    /// Parse the leading bytes of a video tag body; returns the header and
    /// the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), MediaError> {
        if data.len() < 5 {
            return Err(MediaError::InvalidVideoTag);
        }

        let flags = data[0];
        let mut header = VideoTagHeader {
            frame_type: flags >> 4,
            codec_id: flags & 0x0F,
            avc_packet_type: 0,
            composition_time: 0,
        };

        let mut n = 1;
        if header.frame_type == FRAME_KEY || header.frame_type == FRAME_INTER {
            header.avc_packet_type = data[1];
            let raw =
                (i32::from(data[2]) << 16) | (i32::from(data[3]) << 8) | i32::from(data[4]);
            header.composition_time = if raw & 0x80_0000 != 0 {
                raw | !0xFF_FFFF
            } else {
                raw
            };
            n += 4;
        }

        Ok((header, n))
    }

    pub fn is_key_frame(&self) -> bool {
        self.frame_type == FRAME_KEY
    }

    /// Key frame carrying the AVCDecoderConfigurationRecord
    pub fn is_seq_header(&self) -> bool {
        self.frame_type == FRAME_KEY && self.avc_packet_type == AVC_SEQ_HEADER
    }

    pub fn is_end_of_seq(&self) -> bool {
        self.avc_packet_type == AVC_END_OF_SEQ
    }

    pub fn is_h264(&self) -> bool {
        self.codec_id == CODEC_H264
    }
}

/// Detect the AVC end-of-sequence marker (`0x17 0x02`), which subscribers
/// treat as a benign skip rather than media.
pub fn is_avc_end_of_seq(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x17 && data[1] == 0x02
}
