//! MPEG-TS muxer
//!
//! Emits fixed 188-byte transport packets. Each media packet becomes one
//! PES packet split across as many TS packets as its payload needs:
//!
//! ```text
//! | 0x47 | flags+PID | AF ctrl + CC | [adaptation] | PES header | payload |
//! ```
//!
//! PIDs: PAT 0x0000, PMT 0x1000, video 0x100, audio 0x101. Stream ids
//! 0xE0 (video) and 0xC0 (audio). All timestamps ride the 90 kHz clock.
//! The first TS packet of a keyframe PES carries a PCR in its adaptation
//! field; short tails are absorbed by adaptation-field stuffing. PAT and
//! PMT are (re-)emitted at every segment start.

use bytes::{BufMut, BytesMut};

use crate::hub::packet::Packet;
use crate::media::flv::{SOUND_MP3, SOUND_MP3_8K};
use crate::ts::crc32::mpeg_crc32;

pub const TS_PACKET_LEN: usize = 188;
const TS_BODY_LEN: usize = 184;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

const VIDEO_SID: u8 = 0xE0;
const AUDIO_SID: u8 = 0xC0;

/// 90 kHz ticks per millisecond
pub const TICKS_PER_MS: i64 = 90;

// PMT stream types
const STREAM_TYPE_H264: u8 = 0x1B;
const STREAM_TYPE_AAC: u8 = 0x0F;
const STREAM_TYPE_MP3: u8 = 0x04;

/// Stateful TS muxer: continuity counters survive across packets within a
/// stream; PAT/PMT counters have their own sequence.
#[derive(Debug, Default)]
pub struct TsMuxer {
    video_cc: u8,
    audio_cc: u8,
    pat_cc: u8,
    pmt_cc: u8,
}

impl TsMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mux one media packet into TS packets appended to `out`.
    ///
    /// `packet.timestamp` is the DTS in milliseconds; video PTS adds the
    /// composition-time offset.
    pub fn mux(&mut self, packet: &Packet, out: &mut BytesMut) {
        let dts = i64::from(packet.timestamp) * TICKS_PER_MS;
        let mut pts = dts;

        let (pid, sid, keyframe) = if packet.is_video() {
            let header = packet.video_header();
            if let Some(h) = header {
                pts = dts + i64::from(h.composition_time) * TICKS_PER_MS;
            }
            (
                VIDEO_PID,
                VIDEO_SID,
                header.map(|h| h.is_key_frame()).unwrap_or(false),
            )
        } else {
            (AUDIO_PID, AUDIO_SID, false)
        };

        let pes = PesHeader::build(sid, pts, dts, packet.data.len());

        // Logical byte stream: PES header then payload.
        let header_bytes = &pes.data[..pes.len];
        let payload = &packet.data[..];
        let total = header_bytes.len() + payload.len();

        let mut offset = 0usize;
        let mut first = true;
        while offset < total {
            let cc = self.bump_cc(pid);
            let remaining = total - offset;

            // PCR rides the adaptation field of the keyframe's first packet.
            let with_pcr = first && keyframe;
            let space = TS_BODY_LEN - if with_pcr { 8 } else { 0 };
            let body = remaining.min(space);

            let mut ts_packet = [0u8; TS_PACKET_LEN];
            ts_packet[0] = 0x47;
            ts_packet[1] = (pid >> 8) as u8 | if first { 0x40 } else { 0x00 };
            ts_packet[2] = pid as u8;
            ts_packet[3] = 0x10 | (cc & 0x0F);

            if with_pcr || body < TS_BODY_LEN {
                // Adaptation field absorbs the PCR and any stuffing.
                ts_packet[3] |= 0x20;
                let field_len = (TS_BODY_LEN - 1 - body) as u8;
                ts_packet[4] = field_len;
                if field_len > 0 {
                    ts_packet[5] = if with_pcr { 0x50 } else { 0x00 };
                    let mut i = 6;
                    if with_pcr {
                        write_pcr(&mut ts_packet[i..i + 6], dts);
                        i += 6;
                    }
                    for b in &mut ts_packet[i..TS_PACKET_LEN - body] {
                        *b = 0xFF;
                    }
                }
            }

            let mut write_at = TS_PACKET_LEN - body;
            let mut left = body;
            if offset < header_bytes.len() {
                let take = left.min(header_bytes.len() - offset);
                ts_packet[write_at..write_at + take]
                    .copy_from_slice(&header_bytes[offset..offset + take]);
                write_at += take;
                offset += take;
                left -= take;
            }
            if left > 0 {
                let pos = offset - header_bytes.len();
                ts_packet[write_at..write_at + left].copy_from_slice(&payload[pos..pos + left]);
                offset += left;
            }

            out.put_slice(&ts_packet);
            first = false;
        }
    }

    /// Program association table announcing program 1 on the PMT PID
    pub fn pat(&mut self) -> [u8; TS_PACKET_LEN] {
        let mut packet = [0xFFu8; TS_PACKET_LEN];

        // TS header + pointer field.
        let cc = self.pat_cc & 0x0F;
        self.pat_cc = self.pat_cc.wrapping_add(1);
        packet[..5].copy_from_slice(&[0x47, 0x40, 0x00, 0x10 | cc, 0x00]);

        // PAT section: one program -> PMT PID 0x1000.
        let section: [u8; 12] = [
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00,
        ];
        packet[5..17].copy_from_slice(&section);

        let crc = mpeg_crc32(&section);
        packet[17..21].copy_from_slice(&crc.to_be_bytes());

        packet
    }

    /// Program map table declaring the elementary streams. `sound_format`
    /// picks AAC or MP3; audio-only streams get a single-entry table with
    /// the PCR on the audio PID.
    pub fn pmt(&mut self, sound_format: u8, has_video: bool) -> [u8; TS_PACKET_LEN] {
        let mut packet = [0xFFu8; TS_PACKET_LEN];

        let cc = self.pmt_cc & 0x0F;
        self.pmt_cc = self.pmt_cc.wrapping_add(1);
        packet[..5].copy_from_slice(&[0x47, 0x40 | (PMT_PID >> 8) as u8, PMT_PID as u8, 0x10 | cc, 0x00]);

        let audio_type = if sound_format == SOUND_MP3 || sound_format == SOUND_MP3_8K {
            STREAM_TYPE_MP3
        } else {
            STREAM_TYPE_AAC
        };

        let mut es_info: Vec<u8> = Vec::with_capacity(10);
        if has_video {
            es_info.extend_from_slice(&[STREAM_TYPE_H264, 0xE1, 0x00, 0xF0, 0x00]);
        }
        es_info.extend_from_slice(&[audio_type, 0xE1, 0x01, 0xF0, 0x00]);

        // PCR PID: video when present, otherwise audio.
        let pcr_pid = if has_video { VIDEO_PID } else { AUDIO_PID };

        let mut section: Vec<u8> = Vec::with_capacity(12 + es_info.len());
        section.extend_from_slice(&[
            0x02,
            0xB0,
            (es_info.len() + 9 + 4) as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (pcr_pid >> 8) as u8,
            pcr_pid as u8,
            0xF0,
            0x00,
        ]);
        section.extend_from_slice(&es_info);

        packet[5..5 + section.len()].copy_from_slice(&section);
        let crc = mpeg_crc32(&section);
        packet[5 + section.len()..9 + section.len()].copy_from_slice(&crc.to_be_bytes());

        packet
    }

    fn bump_cc(&mut self, pid: u16) -> u8 {
        let cc = if pid == VIDEO_PID {
            &mut self.video_cc
        } else {
            &mut self.audio_cc
        };
        *cc = (*cc + 1) & 0x0F;
        *cc
    }
}

/// PES header bytes for one access unit (or audio frame batch)
struct PesHeader {
    len: usize,
    data: [u8; 32],
}

impl PesHeader {
    fn build(sid: u8, pts: i64, dts: i64, payload_len: usize) -> Self {
        let mut data = [0u8; 32];
        data[0] = 0x00;
        data[1] = 0x00;
        data[2] = 0x01;
        data[3] = sid;

        let video = sid == VIDEO_SID;
        let mut flag: u8 = 0x80; // PTS present
        let mut header_size = 5;
        if video && pts != dts {
            flag |= 0x40; // DTS present
            header_size += 5;
        }

        // Length covers everything after the length field itself; values
        // beyond 16 bits are written as 0 ("unbounded", video only).
        let mut size = payload_len + header_size + 3;
        if size > 0xFFFF {
            size = 0;
        }
        data[4] = (size >> 8) as u8;
        data[5] = size as u8;

        data[6] = 0x80;
        data[7] = flag;
        data[8] = header_size as u8;

        let mut i = 9;
        write_ts(&mut data[i..i + 5], flag >> 6, pts);
        i += 5;
        if video && pts != dts {
            write_ts(&mut data[i..i + 5], 1, dts);
            i += 5;
        }

        PesHeader { len: i, data }
    }
}

/// 33-bit timestamp packed into 5 bytes with marker bits every 15 bits
fn write_ts(dst: &mut [u8], fb: u8, ts: i64) {
    let mut ts = ts;
    if ts > 0x1_FFFF_FFFF {
        ts -= 0x1_FFFF_FFFF;
    }

    let val = (u32::from(fb) << 4) | ((((ts >> 30) as u32) & 0x07) << 1) | 1;
    dst[0] = val as u8;

    let val = ((((ts >> 15) as u32) & 0x7FFF) << 1) | 1;
    dst[1] = (val >> 8) as u8;
    dst[2] = val as u8;

    let val = (((ts as u32) & 0x7FFF) << 1) | 1;
    dst[3] = (val >> 8) as u8;
    dst[4] = val as u8;
}

/// PCR: 33-bit base, 6 reserved bits, 9-bit extension (zero)
fn write_pcr(dst: &mut [u8], pcr: i64) {
    dst[0] = (pcr >> 25) as u8;
    dst[1] = (pcr >> 17) as u8;
    dst[2] = (pcr >> 9) as u8;
    dst[3] = (pcr >> 1) as u8;
    dst[4] = (((pcr & 0x1) as u8) << 7) | 0x7E;
    dst[5] = 0x00;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::packet::test_support::*;
    use bytes::{Bytes, BytesMut};
    use crate::hub::packet::Packet;

    fn packets_of(out: &BytesMut) -> Vec<&[u8]> {
        assert_eq!(out.len() % TS_PACKET_LEN, 0, "output is 188-aligned");
        out.chunks(TS_PACKET_LEN).collect()
    }

    fn pid_of(p: &[u8]) -> u16 {
        (u16::from(p[1] & 0x1F) << 8) | u16::from(p[2])
    }

    #[test]
    fn every_packet_is_188_and_synced() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&keyframe(0), &mut out);
        muxer.mux(&audio_frame(23), &mut out);

        for p in packets_of(&out) {
            assert_eq!(p.len(), TS_PACKET_LEN);
            assert_eq!(p[0], 0x47);
        }
    }

    #[test]
    fn large_payload_spans_packets_with_continuous_cc() {
        let mut data = BytesMut::new();
        data.put_slice(&[0x27, 0x01, 0x00, 0x00, 0x00]);
        data.put_u32(1000);
        data.put_slice(&[0x41; 1000]);
        let packet = Packet::video(40, 1, data.freeze()).unwrap();

        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&packet, &mut out);

        let packets = packets_of(&out);
        assert!(packets.len() >= 6);

        // PUSI only on the first packet; CC strictly increments mod 16.
        assert_eq!(packets[0][1] & 0x40, 0x40);
        let mut prev_cc = packets[0][3] & 0x0F;
        for p in &packets[1..] {
            assert_eq!(p[1] & 0x40, 0x00);
            assert_eq!(pid_of(p), VIDEO_PID);
            let cc = p[3] & 0x0F;
            assert_eq!(cc, (prev_cc + 1) & 0x0F);
            prev_cc = cc;
        }
    }

    #[test]
    fn keyframe_first_packet_carries_pcr() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&keyframe(1000), &mut out);

        let packets = packets_of(&out);
        let first = packets[0];

        // Adaptation field present with PCR flag + random-access indicator.
        assert_eq!(first[3] & 0x20, 0x20);
        assert!(first[4] >= 7);
        assert_eq!(first[5] & 0x50, 0x50);

        // PCR base == dts (90 kHz): 1000 ms -> 90000 ticks.
        let base = (u64::from(first[6]) << 25)
            | (u64::from(first[7]) << 17)
            | (u64::from(first[8]) << 9)
            | (u64::from(first[9]) << 1)
            | (u64::from(first[10]) >> 7);
        assert_eq!(base, 90_000);
    }

    #[test]
    fn inter_frame_has_no_pcr() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&inter_frame(1000), &mut out);

        let first = packets_of(&out)[0];
        if first[3] & 0x20 != 0 {
            // Adaptation present only for stuffing; no PCR flag.
            assert_eq!(first[5] & 0x10, 0x00);
        }
    }

    #[test]
    fn audio_uses_audio_pid_and_sid() {
        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&audio_frame(0), &mut out);

        let first = packets_of(&out)[0];
        assert_eq!(pid_of(first), AUDIO_PID);

        // PES start code and stream id inside the payload.
        let af_len = if first[3] & 0x20 != 0 {
            1 + usize::from(first[4])
        } else {
            0
        };
        let pes = &first[4 + af_len..];
        assert_eq!(&pes[..3], &[0x00, 0x00, 0x01]);
        assert_eq!(pes[3], AUDIO_SID);
        // Audio: PTS only, no DTS.
        assert_eq!(pes[7], 0x80);
        assert_eq!(pes[8], 5);
    }

    #[test]
    fn video_with_composition_time_has_both_timestamps() {
        let mut data = BytesMut::new();
        data.put_slice(&[0x27, 0x01, 0x00, 0x00, 0x64]); // ct = 100 ms
        data.put_u32(4);
        data.put_slice(&[0x41, 0x9A, 0x00, 0x01]);
        let packet = Packet::video(1000, 1, data.freeze()).unwrap();

        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&packet, &mut out);

        let first = packets_of(&out)[0];
        let af_len = if first[3] & 0x20 != 0 {
            1 + usize::from(first[4])
        } else {
            0
        };
        let pes = &first[4 + af_len..];
        assert_eq!(pes[7], 0xC0); // PTS + DTS
        assert_eq!(pes[8], 10);

        // Decode PTS: marker layout 0011 xxx1 ...
        let pts = (u64::from(pes[9] & 0x0E) << 29)
            | (u64::from(pes[10]) << 22)
            | (u64::from(pes[11] & 0xFE) << 14)
            | (u64::from(pes[12]) << 7)
            | (u64::from(pes[13]) >> 1);
        let dts = (u64::from(pes[14] & 0x0E) << 29)
            | (u64::from(pes[15]) << 22)
            | (u64::from(pes[16] & 0xFE) << 14)
            | (u64::from(pes[17]) << 7)
            | (u64::from(pes[18]) >> 1);
        assert_eq!(dts, 90_000);
        assert_eq!(pts, 90_000 + 9_000);
    }

    #[test]
    fn oversized_pes_length_written_unbounded() {
        let mut data = BytesMut::new();
        data.put_slice(&[0x27, 0x01, 0x00, 0x00, 0x00]);
        data.put_u32(70_000);
        data.put_slice(&vec![0x41; 70_000]);
        let packet = Packet::video(0, 1, data.freeze()).unwrap();

        let mut muxer = TsMuxer::new();
        let mut out = BytesMut::new();
        muxer.mux(&packet, &mut out);

        let first = packets_of(&out)[0];
        let af_len = if first[3] & 0x20 != 0 {
            1 + usize::from(first[4])
        } else {
            0
        };
        let pes = &first[4 + af_len..];
        assert_eq!(pes[4], 0);
        assert_eq!(pes[5], 0);
    }

    #[test]
    fn pat_layout() {
        let mut muxer = TsMuxer::new();
        let pat = muxer.pat();

        assert_eq!(pat.len(), TS_PACKET_LEN);
        assert_eq!(&pat[..5], &[0x47, 0x40, 0x00, 0x10, 0x00]);
        // Program 1 -> PMT PID 0x1000.
        assert_eq!(&pat[13..17], &[0x00, 0x01, 0xF0, 0x00]);
        // CRC over the section validates.
        assert_eq!(
            mpeg_crc32(&pat[5..17]).to_be_bytes(),
            [pat[17], pat[18], pat[19], pat[20]]
        );
        // Stuffed to the end.
        assert!(pat[21..].iter().all(|&b| b == 0xFF));

        // CC increments per emission.
        let pat2 = muxer.pat();
        assert_eq!(pat2[3] & 0x0F, (pat[3] & 0x0F) + 1);
    }

    #[test]
    fn pmt_declares_stream_types() {
        let mut muxer = TsMuxer::new();
        let pmt = muxer.pmt(10, true); // AAC + video

        assert_eq!(pmt[1], 0x50);
        assert_eq!(pmt[2], 0x00); // PID 0x1000
        let section_len = usize::from(pmt[7]);
        assert_eq!(section_len, 10 + 9 + 4);
        // H.264 on PID 0x100, AAC on PID 0x101.
        assert_eq!(&pmt[17..22], &[0x1B, 0xE1, 0x00, 0xF0, 0x00]);
        assert_eq!(&pmt[22..27], &[0x0F, 0xE1, 0x01, 0xF0, 0x00]);
        // CRC validates.
        let end = 5 + 12 + 10;
        assert_eq!(
            mpeg_crc32(&pmt[5..end]).to_be_bytes(),
            [pmt[end], pmt[end + 1], pmt[end + 2], pmt[end + 3]]
        );
    }

    #[test]
    fn pmt_mp3_and_audio_only() {
        let mut muxer = TsMuxer::new();
        let pmt = muxer.pmt(2, true);
        assert_eq!(pmt[22], STREAM_TYPE_MP3);

        let pmt = muxer.pmt(10, false);
        // Single audio entry; PCR on the audio PID.
        assert_eq!(&pmt[13..15], &[0xE1, 0x01]);
        assert_eq!(pmt[17], STREAM_TYPE_AAC);
    }
}
