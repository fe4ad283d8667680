//! AAC parsing and ADTS framing
//!
//! RTMP carries AAC raw (no ADTS headers); the sequence header is a
//! bit-packed AudioSpecificConfig:
//!
//! ```text
//! audioObjectType(5) | samplingFrequencyIndex(4) | channelConfiguration(4) | ...
//! ```
//!
//! MPEG-TS wants self-synchronising ADTS frames, so [`AdtsWriter`] prepends
//! a 7-byte header per raw frame once the config has been seen.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// Sampling frequencies by AudioSpecificConfig index
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Samples per AAC frame (frameLengthFlag=0, the only layout seen in FLV)
pub const SAMPLES_PER_FRAME: u32 = 1024;

const ADTS_HEADER_LEN: usize = 7;

/// Parsed AudioSpecificConfig
#[derive(Debug, Clone)]
pub struct AacConfig {
    /// Audio object type (2 = AAC-LC in practice)
    pub object_type: u8,
    pub sampling_index: u8,
    pub sample_rate: u32,
    pub channels: u8,
    /// Raw config bytes as received
    pub raw: Bytes,
}

impl AacConfig {
    /// Parse the body of an AAC sequence header
    pub fn parse(data: Bytes) -> Result<Self, MediaError> {
        if data.len() < 2 {
            return Err(MediaError::InvalidAacConfig);
        }

        let object_type = (data[0] >> 3) & 0x1F;
        let sampling_index = ((data[0] & 0x07) << 1) | (data[1] >> 7);
        let channels = (data[1] >> 3) & 0x0F;

        let sample_rate = SAMPLE_RATES
            .get(sampling_index as usize)
            .copied()
            .unwrap_or(44100);

        Ok(AacConfig {
            object_type,
            sampling_index,
            sample_rate,
            channels,
            raw: data,
        })
    }
}

/// Frames raw AAC payloads into ADTS once configured
#[derive(Debug, Default)]
pub struct AdtsWriter {
    config: Option<AacConfig>,
}

impl AdtsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the AudioSpecificConfig from a sequence-header payload
    pub fn set_config(&mut self, data: Bytes) -> Result<&AacConfig, MediaError> {
        self.config = Some(AacConfig::parse(data)?);
        Ok(self.config.as_ref().unwrap())
    }

    pub fn config(&self) -> Option<&AacConfig> {
        self.config.as_ref()
    }

    /// Sample rate from the config, 44100 until one is seen
    pub fn sample_rate(&self) -> u32 {
        self.config.as_ref().map(|c| c.sample_rate).unwrap_or(44100)
    }

    /// Append one ADTS frame (7-byte header + payload) to `out`
    pub fn write_frame(&self, payload: &[u8], out: &mut BytesMut) -> Result<(), MediaError> {
        let config = self.config.as_ref().ok_or(MediaError::MissingAacConfig)?;
        if payload.is_empty() {
            return Err(MediaError::MissingAacConfig);
        }

        let frame_len = (payload.len() + ADTS_HEADER_LEN) as u16;
        let profile = config.object_type.wrapping_sub(1) & 0x3;

        out.reserve(ADTS_HEADER_LEN + payload.len());
        // Syncword 0xFFF, MPEG-4, layer 0, no CRC
        out.put_u8(0xFF);
        out.put_u8(0xF1);
        out.put_u8((profile << 6) | (config.sampling_index << 2) | ((config.channels >> 2) & 0x1));
        out.put_u8(((config.channels & 0x3) << 6) | ((frame_len >> 11) as u8 & 0x3));
        out.put_u8((frame_len >> 3) as u8);
        // Buffer fullness 0x7FF (VBR), one raw data block
        out.put_u8((((frame_len & 0x7) as u8) << 5) | 0x1F);
        out.put_u8(0xFC);
        out.put_slice(payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 48 kHz stereo AAC-LC: objectType=2, index=3, channels=2
    fn config_48k() -> Bytes {
        Bytes::from_static(&[0x11, 0x90])
    }

    // 44.1 kHz stereo AAC-LC
    fn config_44k1() -> Bytes {
        Bytes::from_static(&[0x12, 0x10])
    }

    #[test]
    fn parse_config_44k1() {
        let c = AacConfig::parse(config_44k1()).unwrap();
        assert_eq!(c.object_type, 2);
        assert_eq!(c.sampling_index, 4);
        assert_eq!(c.sample_rate, 44100);
        assert_eq!(c.channels, 2);
    }

    #[test]
    fn parse_config_48k() {
        let c = AacConfig::parse(config_48k()).unwrap();
        assert_eq!(c.object_type, 2);
        assert_eq!(c.sampling_index, 3);
        assert_eq!(c.sample_rate, 48000);
        assert_eq!(c.channels, 2);
    }

    #[test]
    fn short_config_rejected() {
        assert!(AacConfig::parse(Bytes::from_static(&[0x12])).is_err());
    }

    #[test]
    fn out_of_range_index_defaults() {
        // index 14 (escape values) falls back to 44100
        let c = AacConfig::parse(Bytes::from_static(&[0x17, 0x10])).unwrap();
        assert_eq!(c.sampling_index, 14);
        assert_eq!(c.sample_rate, 44100);
    }

    #[test]
    fn adts_header_layout() {
        let mut writer = AdtsWriter::new();
        writer.set_config(config_44k1()).unwrap();

        let payload = [0x21u8; 100];
        let mut out = BytesMut::new();
        writer.write_frame(&payload, &mut out).unwrap();

        assert_eq!(out.len(), 107);
        assert_eq!(out[0], 0xFF);
        assert_eq!(out[1], 0xF1);

        // Frame length field equals payload + 7.
        let len = ((u16::from(out[3]) & 0x3) << 11)
            | (u16::from(out[4]) << 3)
            | (u16::from(out[5]) >> 5);
        assert_eq!(len, 107);

        // Profile = objectType - 1 (AAC-LC -> 1), sampling index 4.
        assert_eq!(out[2] >> 6, 1);
        assert_eq!((out[2] >> 2) & 0xF, 4);
        // Stereo.
        assert_eq!(out[3] >> 6, 2);
        // Buffer fullness all-ones, zero raw blocks.
        assert_eq!(out[5] & 0x1F, 0x1F);
        assert_eq!(out[6], 0xFC);

        assert_eq!(&out[7..], &payload[..]);
    }

    #[test]
    fn frame_before_config_rejected() {
        let writer = AdtsWriter::new();
        let mut out = BytesMut::new();
        assert!(writer.write_frame(&[0u8; 4], &mut out).is_err());
    }

    #[test]
    fn sample_rate_defaults_until_configured() {
        let mut writer = AdtsWriter::new();
        assert_eq!(writer.sample_rate(), 44100);
        writer.set_config(config_48k()).unwrap();
        assert_eq!(writer.sample_rate(), 48000);
    }

    #[test]
    fn consecutive_frames_share_config() {
        let mut writer = AdtsWriter::new();
        writer.set_config(config_48k()).unwrap();

        let mut out = BytesMut::new();
        writer.write_frame(&[1u8; 10], &mut out).unwrap();
        writer.write_frame(&[2u8; 20], &mut out).unwrap();
        assert_eq!(out.len(), 17 + 27);
        assert_eq!(out[17], 0xFF);
    }
}
