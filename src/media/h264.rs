//! H.264 parsing and AVCC to Annex-B conversion
//!
//! RTMP carries H.264 in AVCC form: a sequence header holding the
//! AVCDecoderConfigurationRecord, then length-prefixed NAL units. MPEG-TS
//! wants Annex-B: start-code-prefixed NALUs with parameter sets repeated in
//! band before each IDR.
//!
//! AVCDecoderConfigurationRecord:
//! ```text
//! version(1) profile(1) compat(1) level(1) | lengthSizeMinusOne(2 bits)
//! | numSPS(5 bits) { spsLen(2) sps }* | numPPS(1) { ppsLen(2) pps }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MediaError;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// Access unit delimiter emitted at the head of every converted picture
const ACCESS_UNIT_DELIMITER: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];

/// NAL unit types (five low bits of the first NALU byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    Slice = 1,
    SlicePartA = 2,
    SlicePartB = 3,
    SlicePartC = 4,
    Idr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    Aud = 9,
    EndSeq = 10,
    EndStream = 11,
    Filler = 12,
}

impl NaluType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x1F {
            1 => Some(NaluType::Slice),
            2 => Some(NaluType::SlicePartA),
            3 => Some(NaluType::SlicePartB),
            4 => Some(NaluType::SlicePartC),
            5 => Some(NaluType::Idr),
            6 => Some(NaluType::Sei),
            7 => Some(NaluType::Sps),
            8 => Some(NaluType::Pps),
            9 => Some(NaluType::Aud),
            10 => Some(NaluType::EndSeq),
            11 => Some(NaluType::EndStream),
            12 => Some(NaluType::Filler),
            _ => None,
        }
    }
}

/// Parsed AVCDecoderConfigurationRecord
#[derive(Debug, Clone)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// NALU length-prefix size in bytes (almost always 4)
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    /// Raw record bytes as received
    pub raw: Bytes,
}

impl AvcConfig {
    pub fn parse(data: Bytes) -> Result<Self, MediaError> {
        if data.len() < 7 {
            return Err(MediaError::InvalidAvcConfig);
        }

        let raw = data.clone();
        let mut data = data;

        let version = data.get_u8();
        if version != 1 {
            return Err(MediaError::InvalidAvcConfig);
        }

        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let mut sps = Vec::with_capacity(num_sps);
        for _ in 0..num_sps {
            if data.len() < 2 {
                return Err(MediaError::InvalidAvcConfig);
            }
            let len = data.get_u16() as usize;
            if data.len() < len || len == 0 {
                return Err(MediaError::InvalidAvcConfig);
            }
            sps.push(data.copy_to_bytes(len));
        }

        if data.is_empty() {
            return Err(MediaError::InvalidAvcConfig);
        }
        let num_pps = data.get_u8() as usize;
        let mut pps = Vec::with_capacity(num_pps);
        for _ in 0..num_pps {
            if data.len() < 2 {
                return Err(MediaError::InvalidAvcConfig);
            }
            let len = data.get_u16() as usize;
            if data.len() < len || len == 0 {
                return Err(MediaError::InvalidAvcConfig);
            }
            pps.push(data.copy_to_bytes(len));
        }

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
            raw,
        })
    }

    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            66 => "Baseline",
            77 => "Main",
            88 => "Extended",
            100 => "High",
            110 => "High 10",
            122 => "High 4:2:2",
            244 => "High 4:4:4",
            _ => "Unknown",
        }
    }

    /// Level as "major.minor" (e.g. 31 -> "3.1")
    pub fn level_string(&self) -> String {
        format!("{}.{}", self.level / 10, self.level % 10)
    }
}

/// Iterator over length-prefixed NAL units
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8], length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            length_size: length_size as usize,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + self.length_size > self.data.len() {
            return None;
        }

        let mut len: usize = 0;
        for i in 0..self.length_size {
            len = (len << 8) | usize::from(self.data[self.offset + i]);
        }
        self.offset += self.length_size;

        if len == 0 || self.offset + len > self.data.len() {
            return None;
        }

        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}

/// Converts AVCC pictures to Annex-B, caching SPS/PPS from the sequence
/// header so they can be re-emitted before IDR frames.
#[derive(Debug, Default)]
pub struct AnnexBConverter {
    config: Option<AvcConfig>,
    /// Cached SPS+PPS, start-code prefixed, from the sequence header
    parameter_sets: Bytes,
}

impl AnnexBConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record SPS/PPS from a sequence-header payload
    pub fn set_config(&mut self, data: Bytes) -> Result<&AvcConfig, MediaError> {
        let config = AvcConfig::parse(data)?;

        let mut cached = BytesMut::new();
        for sps in &config.sps {
            cached.put_slice(&START_CODE);
            cached.put_slice(sps);
        }
        for pps in &config.pps {
            cached.put_slice(&START_CODE);
            cached.put_slice(pps);
        }
        self.parameter_sets = cached.freeze();

        self.config = Some(config);
        Ok(self.config.as_ref().unwrap())
    }

    pub fn config(&self) -> Option<&AvcConfig> {
        self.config.as_ref()
    }

    /// Convert one AVCC picture into Annex-B appended to `out`.
    ///
    /// Emits an access unit delimiter, then slice, SEI and IDR NALUs
    /// start-code prefixed. Parameter sets arriving in band are buffered
    /// and written before the IDR of the same access unit; when an IDR
    /// arrives without them, the cached sequence-header sets are written
    /// instead. Every other NAL type (source delimiters, slice data
    /// partitions, end markers, filler) is dropped. Input already in
    /// Annex-B form passes through untouched.
    pub fn convert(&self, data: &[u8], out: &mut BytesMut) -> Result<(), MediaError> {
        if data.starts_with(&START_CODE) {
            out.put_slice(data);
            return Ok(());
        }

        let length_size = self
            .config
            .as_ref()
            .map(|c| c.nalu_length_size)
            .unwrap_or(4);
        if data.len() < usize::from(length_size) {
            return Err(MediaError::InvalidNalu);
        }

        out.put_slice(&ACCESS_UNIT_DELIMITER);

        let mut inline_sets = BytesMut::new();
        let mut wrote_sets = false;
        let mut consumed = 0usize;

        for nalu in NaluIterator::new(data, length_size) {
            consumed += usize::from(length_size) + nalu.len();

            match NaluType::from_byte(nalu[0]) {
                Some(NaluType::Sps) | Some(NaluType::Pps) => {
                    inline_sets.put_slice(&START_CODE);
                    inline_sets.put_slice(nalu);
                }
                Some(NaluType::Idr) => {
                    if !wrote_sets {
                        wrote_sets = true;
                        if inline_sets.is_empty() {
                            out.put_slice(&self.parameter_sets);
                        } else {
                            out.put_slice(&inline_sets);
                        }
                    }
                    out.put_slice(&START_CODE);
                    out.put_slice(nalu);
                }
                Some(NaluType::Slice) | Some(NaluType::Sei) => {
                    out.put_slice(&START_CODE);
                    out.put_slice(nalu);
                }
                // Slice data partitions, end-of-sequence/stream markers,
                // source AUDs, filler and unknown types carry nothing a TS
                // consumer needs.
                _ => {}
            }
        }

        if consumed != data.len() {
            return Err(MediaError::InvalidNalu);
        }
        Ok(())
    }
}

/// Re-frame Annex-B data into AVCC with the given length-prefix size.
/// The inverse of [`AnnexBConverter::convert`] for NALU payloads.
pub fn annexb_to_avcc(data: &[u8], length_size: u8, out: &mut BytesMut) {
    let mut nalus: Vec<&[u8]> = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 4 <= data.len() {
        if data[i..i + 4] == START_CODE {
            if let Some(s) = start {
                nalus.push(&data[s..i]);
            }
            start = Some(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        nalus.push(&data[s..]);
    }

    for nalu in nalus {
        let len = nalu.len();
        for i in (0..length_size).rev() {
            out.put_u8((len >> (8 * usize::from(i))) as u8);
        }
        out.put_slice(nalu);
    }
}
