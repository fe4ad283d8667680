//! Media packets
//!
//! The unit of exchange through the hub: a classified FLV tag body with its
//! parsed codec header carried inline. Payloads are reference-counted
//! `Bytes`, so fan-out to many subscribers never copies media.

use bytes::Bytes;

use crate::error::MediaError;
use crate::media::flv::{AudioTagHeader, VideoTagHeader};
use crate::protocol::constants::{MSG_AUDIO, MSG_DATA_AMF0, MSG_VIDEO};

/// Packet classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
    Metadata,
}

/// Codec header variant carried inline in the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Audio(AudioTagHeader),
    Video(VideoTagHeader),
    None,
}

/// One media packet flowing from a publisher to subscribers
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    /// Milliseconds, 32-bit, wraps
    pub timestamp: u32,
    pub stream_id: u32,
    pub header: PacketHeader,
    pub data: Bytes,
}

impl Packet {
    /// Build an audio packet, parsing the tag header
    pub fn audio(timestamp: u32, stream_id: u32, data: Bytes) -> Result<Self, MediaError> {
        let (header, _) = AudioTagHeader::parse(&data)?;
        Ok(Self {
            kind: PacketKind::Audio,
            timestamp,
            stream_id,
            header: PacketHeader::Audio(header),
            data,
        })
    }

    /// Build a video packet, parsing the tag header
    pub fn video(timestamp: u32, stream_id: u32, data: Bytes) -> Result<Self, MediaError> {
        let (header, _) = VideoTagHeader::parse(&data)?;
        Ok(Self {
            kind: PacketKind::Video,
            timestamp,
            stream_id,
            header: PacketHeader::Video(header),
            data,
        })
    }

    /// Build a metadata (script data) packet
    pub fn metadata(timestamp: u32, stream_id: u32, data: Bytes) -> Self {
        Self {
            kind: PacketKind::Metadata,
            timestamp,
            stream_id,
            header: PacketHeader::None,
            data,
        }
    }

    pub fn is_audio(&self) -> bool {
        self.kind == PacketKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.kind == PacketKind::Video
    }

    pub fn is_metadata(&self) -> bool {
        self.kind == PacketKind::Metadata
    }

    pub fn audio_header(&self) -> Option<&AudioTagHeader> {
        match &self.header {
            PacketHeader::Audio(h) => Some(h),
            _ => None,
        }
    }

    pub fn video_header(&self) -> Option<&VideoTagHeader> {
        match &self.header {
            PacketHeader::Video(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_key_frame(&self) -> bool {
        self.video_header().map(|h| h.is_key_frame()).unwrap_or(false)
    }

    /// Video sequence header (AVC decoder configuration)
    pub fn is_video_seq_header(&self) -> bool {
        self.video_header().map(|h| h.is_seq_header()).unwrap_or(false)
    }

    /// Audio sequence header (AudioSpecificConfig)
    pub fn is_audio_seq_header(&self) -> bool {
        self.audio_header().map(|h| h.is_seq_header()).unwrap_or(false)
    }

    pub fn is_seq_header(&self) -> bool {
        self.is_video_seq_header() || self.is_audio_seq_header()
    }

    /// RTMP message type id for the outbound path
    pub fn type_id(&self) -> u8 {
        match self.kind {
            PacketKind::Audio => MSG_AUDIO,
            PacketKind::Video => MSG_VIDEO,
            PacketKind::Metadata => MSG_DATA_AMF0,
        }
    }
}

/// Identity of a stream endpoint
#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    /// `app/name`
    pub key: String,
    pub url: String,
    /// Identifies one publisher or subscriber incarnation
    pub uid: String,
    /// Server-internal endpoints (HLS source, archival) are removed
    /// immediately when their stream closes instead of waiting out the
    /// liveness timeout
    pub internal: bool,
}

impl StreamInfo {
    pub fn new(key: impl Into<String>, url: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            uid: uid.into(),
            internal: false,
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }
}

impl std::fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<key: {}, uid: {}>", self.key, self.uid)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn classification() {
        assert!(video_seq_header(0).is_video_seq_header());
        assert!(video_seq_header(0).is_seq_header());
        assert!(audio_seq_header(0).is_audio_seq_header());
        assert!(keyframe(0).is_key_frame());
        assert!(!keyframe(0).is_seq_header());
        assert!(!inter_frame(0).is_key_frame());
        assert!(!audio_frame(0).is_seq_header());
        assert!(metadata().is_metadata());
    }

    #[test]
    fn type_ids() {
        assert_eq!(audio_frame(0).type_id(), MSG_AUDIO);
        assert_eq!(keyframe(0).type_id(), MSG_VIDEO);
        assert_eq!(metadata().type_id(), MSG_DATA_AMF0);
    }

    #[test]
    fn malformed_video_rejected() {
        assert!(Packet::video(0, 1, Bytes::from_static(&[0x17])).is_err());
    }

    #[test]
    fn info_display() {
        let info = StreamInfo::new("live/demo", "rtmp://x/live/demo", "abc");
        assert_eq!(format!("{info}"), "<key: live/demo, uid: abc>");
        assert!(!info.internal);
        assert!(info.internal().internal);
    }
}
