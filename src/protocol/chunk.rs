//! Chunk-stream framing
//!
//! Messages travel as interleaved chunks, each prefixed with a basic header
//! (format + chunk stream id) and a format-dependent message header:
//!
//! ```text
//! fmt 0 (11 bytes): timestamp(3) length(3) typeId(1) streamId(4, LE)
//! fmt 1 ( 7 bytes): timeDelta(3) length(3) typeId(1)   -- inherits streamId
//! fmt 2 ( 3 bytes): timeDelta(3)                       -- inherits the rest
//! fmt 3 ( 0 bytes): continuation, everything inherited
//! ```
//!
//! A 3-byte timestamp field of 0xFFFFFF is followed by a 4-byte big-endian
//! extended timestamp. For fmt-3 chunks continuing a message whose header
//! declared an extended timestamp, the peer may or may not repeat the
//! extended field; the decoder peeks four bytes and discards them only when
//! they equal the current timestamp.
//!
//! Chunk sizes are negotiated per direction with `SetChunkSize` and default
//! to 128 bytes. Within one csid the chunks of a message arrive in order
//! and uninterrupted; different csids interleave freely.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ChunkError, Result};
use crate::protocol::constants::*;
use crate::protocol::message::Message;

/// Per-csid decode state. Header compression references the previous
/// message's fields on the same chunk stream.
#[derive(Debug, Default)]
struct CsidState {
    /// Format of the last header-carrying chunk (0, 1 or 2); decides how a
    /// fmt-3 chunk that starts a new message treats its inherited timestamp
    format: u8,
    timestamp: u32,
    length: u32,
    type_id: u8,
    stream_id: u32,
    time_delta: u32,
    extended_ts: bool,
    /// True once a fmt-0/1/2 header has been seen on this csid
    seeded: bool,
    payload: BytesMut,
    remain: u32,
}

impl CsidState {
    fn begin_message(&mut self) {
        self.remain = self.length;
        self.payload = BytesMut::with_capacity(self.length as usize);
    }
}

enum Step {
    /// One chunk consumed, message still incomplete
    Consumed,
    /// One chunk consumed and it completed a message
    Complete(Message),
    /// Not enough buffered bytes to consume a whole chunk
    NeedMore,
}

/// Incremental chunk decoder for one direction of one connection
#[derive(Debug)]
pub struct ChunkDecoder {
    chunk_size: u32,
    streams: HashMap<u32, CsidState>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Apply the peer's `SetChunkSize`
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_MESSAGE_LENGTH);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Drop partial state for a csid (peer sent `Abort`)
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.remain = 0;
            state.payload.clear();
        }
    }

    /// Decode as many buffered chunks as possible; returns the next
    /// complete message, or `None` once `buf` holds no whole chunk.
    /// Consumed bytes are removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.decode_chunk(buf)? {
                Step::Complete(msg) => return Ok(Some(msg)),
                Step::Consumed => continue,
                Step::NeedMore => return Ok(None),
            }
        }
    }

    fn decode_chunk(&mut self, buf: &mut BytesMut) -> Result<Step> {
        if buf.is_empty() {
            return Ok(Step::NeedMore);
        }

        // Basic header: 1 byte, plus one or two csid extension bytes.
        let fmt = buf[0] >> 6;
        let csid_base = u32::from(buf[0] & 0x3F);
        let basic_len = match csid_base {
            0 => 2,
            1 => 3,
            _ => 1,
        };
        if buf.len() < basic_len {
            return Ok(Step::NeedMore);
        }
        let csid = match csid_base {
            0 => 64 + u32::from(buf[1]),
            1 => 64 + u32::from(buf[1]) + u32::from(buf[2]) * 256,
            n => n,
        };

        if fmt != 0 && !self.streams.get(&csid).map(|s| s.seeded).unwrap_or(false) {
            return Err(ChunkError::UnexpectedContinuation(csid).into());
        }
        let state = self.streams.entry(csid).or_default();

        // Chunks of one message may not be interrupted on their csid: only
        // fmt 3 continues a partially received message. Anything else is a
        // framing violation and fatal for the connection.
        if state.remain != 0 && fmt != 3 {
            return Err(ChunkError::MessageInterrupted(csid).into());
        }

        // Figure out how many header bytes follow before committing.
        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if buf.len() < basic_len + header_len {
            return Ok(Step::NeedMore);
        }

        let peek = |off: usize, n: usize| -> u32 {
            let mut v = 0u32;
            for i in 0..n {
                v = (v << 8) | u32::from(buf[off + i]);
            }
            v
        };

        // Extended-timestamp presence.
        let ext_len = match fmt {
            0 | 1 | 2 => {
                if peek(basic_len, 3) == 0xFF_FFFF {
                    4
                } else {
                    0
                }
            }
            _ => {
                if state.remain == 0 {
                    // fmt 3 starting a new message repeats the previous
                    // delta (or absolute timestamp) and carries an extended
                    // field iff the previous header did.
                    if state.extended_ts {
                        4
                    } else {
                        0
                    }
                } else if state.extended_ts {
                    // Mid-message continuation: the peer may repeat the
                    // extended timestamp. Peek and discard only on a match.
                    if buf.len() < basic_len + 4 {
                        return Ok(Step::NeedMore);
                    }
                    if peek(basic_len, 4) == state.timestamp {
                        4
                    } else {
                        0
                    }
                } else {
                    0
                }
            }
        };
        if buf.len() < basic_len + header_len + ext_len {
            return Ok(Step::NeedMore);
        }

        // Payload length carried by this chunk.
        let msg_remain = match fmt {
            0 | 1 => peek(basic_len + 3, 3),
            _ => {
                if state.remain == 0 {
                    state.length
                } else {
                    state.remain
                }
            }
        };
        let body_len = msg_remain.min(self.chunk_size) as usize;
        let total = basic_len + header_len + ext_len + body_len;
        if buf.len() < total {
            return Ok(Step::NeedMore);
        }

        // Everything is buffered; consume for real.
        buf.advance(basic_len);

        match fmt {
            0 => {
                let ts = read_u24(buf);
                state.length = read_u24(buf);
                state.type_id = buf.get_u8();
                state.stream_id = buf.get_u32_le();
                if ts == 0xFF_FFFF {
                    state.timestamp = buf.get_u32();
                    state.extended_ts = true;
                } else {
                    state.timestamp = ts;
                    state.extended_ts = false;
                }
                state.format = 0;
                state.seeded = true;
                state.begin_message();
            }
            1 => {
                let mut delta = read_u24(buf);
                state.length = read_u24(buf);
                state.type_id = buf.get_u8();
                if delta == 0xFF_FFFF {
                    delta = buf.get_u32();
                    state.extended_ts = true;
                } else {
                    state.extended_ts = false;
                }
                state.format = 1;
                state.time_delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.begin_message();
            }
            2 => {
                let mut delta = read_u24(buf);
                if delta == 0xFF_FFFF {
                    delta = buf.get_u32();
                    state.extended_ts = true;
                } else {
                    state.extended_ts = false;
                }
                state.format = 2;
                state.time_delta = delta;
                state.timestamp = state.timestamp.wrapping_add(delta);
                state.begin_message();
            }
            3 => {
                if state.remain == 0 {
                    // New message with a bare continuation header: after a
                    // fmt-0 header the timestamp is repeated as-is, after
                    // fmt-1/2 the previous delta is re-applied.
                    if state.format == 0 {
                        if state.extended_ts {
                            state.timestamp = buf.get_u32();
                        }
                    } else {
                        let delta = if state.extended_ts {
                            buf.get_u32()
                        } else {
                            state.time_delta
                        };
                        state.timestamp = state.timestamp.wrapping_add(delta);
                    }
                    state.begin_message();
                } else if ext_len == 4 {
                    buf.advance(4);
                }
            }
            other => return Err(ChunkError::InvalidFormat(other).into()),
        }

        state.payload.put_slice(&buf[..body_len]);
        buf.advance(body_len);
        state.remain -= body_len as u32;

        if state.remain == 0 && state.length as usize == state.payload.len() {
            let msg = Message::new(
                state.type_id,
                state.timestamp,
                state.stream_id,
                state.payload.split().freeze(),
            );
            Ok(Step::Complete(msg))
        } else {
            Ok(Step::Consumed)
        }
    }
}

/// Chunk encoder for one direction of one connection.
///
/// Outbound messages use a fmt-0 header on the first chunk and fmt-3
/// continuations, repeating the extended timestamp on each continuation
/// when the message timestamp does not fit in 24 bits.
#[derive(Debug)]
pub struct ChunkEncoder {
    chunk_size: u32,
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Chunk size we announced with `SetChunkSize`
    pub fn set_chunk_size(&mut self, size: u32) {
        self.chunk_size = size.clamp(1, MAX_MESSAGE_LENGTH);
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Serialise `msg` onto `out` as one fmt-0 chunk plus fmt-3
    /// continuations on the given chunk stream.
    pub fn encode(&self, msg: &Message, csid: u32, out: &mut BytesMut) {
        let extended = msg.timestamp >= 0xFF_FFFF;
        let mut offset = 0usize;
        let len = msg.payload.len();

        let mut first = true;
        loop {
            let fmt = if first { 0 } else { 3 };
            write_basic_header(fmt, csid, out);

            if first {
                let ts_field = if extended { 0xFF_FFFF } else { msg.timestamp };
                write_u24(out, ts_field);
                write_u24(out, len as u32);
                out.put_u8(msg.type_id);
                out.put_u32_le(msg.stream_id);
            }
            if extended {
                out.put_u32(msg.timestamp);
            }

            let take = (len - offset).min(self.chunk_size as usize);
            out.put_slice(&msg.payload[offset..offset + take]);
            offset += take;
            first = false;

            if offset >= len {
                break;
            }
        }
    }
}

/// Pick the conventional outbound chunk stream for a message type
pub fn csid_for(type_id: u8) -> u32 {
    match type_id {
        MSG_AUDIO => CSID_AUDIO,
        MSG_VIDEO => CSID_VIDEO,
        MSG_DATA_AMF0 | MSG_DATA_AMF3 => CSID_DATA,
        MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3 => CSID_COMMAND,
        _ => CSID_PROTOCOL,
    }
}

fn read_u24(buf: &mut BytesMut) -> u32 {
    let v = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
    buf.advance(3);
    v
}

fn write_u24(out: &mut BytesMut, v: u32) {
    out.put_u8((v >> 16) as u8);
    out.put_u8((v >> 8) as u8);
    out.put_u8(v as u8);
}

fn write_basic_header(fmt: u8, csid: u32, out: &mut BytesMut) {
    match csid {
        0..=63 => {
            out.put_u8((fmt << 6) | csid as u8);
        }
        64..=319 => {
            out.put_u8(fmt << 6);
            out.put_u8((csid - 64) as u8);
        }
        _ => {
            out.put_u8((fmt << 6) | 1);
            let v = csid - 64;
            out.put_u8((v & 0xFF) as u8);
            out.put_u8((v >> 8) as u8);
        }
    }
}

/// Encoded size of the basic header for a csid
pub fn basic_header_len(csid: u32) -> usize {
    match csid {
        0..=63 => 1,
        64..=319 => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn roundtrip(msg: &Message, csid: u32, chunk_size: u32) -> Message {
        let mut enc = ChunkEncoder::new();
        enc.set_chunk_size(chunk_size);
        let mut wire = BytesMut::new();
        enc.encode(msg, csid, &mut wire);

        let mut dec = ChunkDecoder::new();
        dec.set_chunk_size(chunk_size);
        let out = dec.decode(&mut wire).unwrap().expect("complete message");
        assert!(wire.is_empty(), "decoder consumed everything");
        out
    }

    #[test]
    fn fmt0_roundtrip() {
        let msg = Message::new(MSG_VIDEO, 1234, 1, Bytes::from(vec![7u8; 300]));
        let out = roundtrip(&msg, CSID_VIDEO, 128);
        assert_eq!(out.type_id, MSG_VIDEO);
        assert_eq!(out.timestamp, 1234);
        assert_eq!(out.stream_id, 1);
        assert_eq!(out.payload, msg.payload);
    }

    #[test]
    fn message_exactly_chunk_size_uses_one_chunk() {
        let msg = Message::new(MSG_AUDIO, 10, 1, Bytes::from(vec![1u8; 128]));
        let mut enc = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        enc.encode(&msg, CSID_AUDIO, &mut wire);

        // basic(1) + header(11) + payload(128); no fmt-3 continuation byte.
        assert_eq!(wire.len(), 1 + 11 + 128);
    }

    #[test]
    fn extended_timestamp_roundtrip() {
        for ts in [0xFF_FFFF_u32, 0x0100_0000, u32::MAX] {
            let msg = Message::new(MSG_VIDEO, ts, 1, Bytes::from(vec![3u8; 200]));
            let out = roundtrip(&msg, CSID_VIDEO, 128);
            assert_eq!(out.timestamp, ts);
            assert_eq!(out.payload.len(), 200);
        }
    }

    #[test]
    fn timestamp_below_limit_not_extended() {
        let msg = Message::new(MSG_VIDEO, 0xFF_FFFE, 1, Bytes::from(vec![1u8; 4]));
        let mut enc = ChunkEncoder::new();
        let mut wire = BytesMut::new();
        enc.encode(&msg, CSID_VIDEO, &mut wire);
        assert_eq!(wire.len(), 1 + 11 + 4);
        assert_eq!(roundtrip(&msg, CSID_VIDEO, 128).timestamp, 0xFF_FFFE);
    }

    #[test]
    fn basic_header_boundaries() {
        for (csid, want) in [
            (2u32, 1usize),
            (63, 1),
            (64, 2),
            (319, 2),
            (320, 3),
            (65599, 3),
        ] {
            assert_eq!(basic_header_len(csid), want, "csid {csid}");

            let msg = Message::new(MSG_AUDIO, 5, 1, Bytes::from_static(b"abcd"));
            let mut wire = BytesMut::new();
            ChunkEncoder::new().encode(&msg, csid, &mut wire);
            assert_eq!(wire.len(), want + 11 + 4);

            let out = roundtrip(&msg, csid, 128);
            assert_eq!(out.payload, msg.payload);
        }
    }

    #[test]
    fn decoder_waits_for_partial_chunk() {
        let msg = Message::new(MSG_VIDEO, 99, 1, Bytes::from(vec![9u8; 64]));
        let mut wire = BytesMut::new();
        ChunkEncoder::new().encode(&msg, CSID_VIDEO, &mut wire);

        let mut dec = ChunkDecoder::new();
        let mut partial = BytesMut::from(&wire[..20]);
        assert!(dec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&wire[20..]);
        let out = dec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(out.payload.len(), 64);
    }

    #[test]
    fn fmt1_and_fmt2_header_compression() {
        // Hand-crafted: fmt0 seeds csid 4, then fmt1 changes length,
        // then fmt2 repeats a delta.
        let mut wire = BytesMut::new();
        // fmt0 csid 4: ts=1000 len=2 type=8 sid=1
        wire.put_u8(0x04);
        write_u24(&mut wire, 1000);
        write_u24(&mut wire, 2);
        wire.put_u8(MSG_AUDIO);
        wire.put_u32_le(1);
        wire.put_slice(&[0xAA, 0xBB]);
        // fmt1 csid 4: delta=20 len=1 type=8
        wire.put_u8(0x44);
        write_u24(&mut wire, 20);
        write_u24(&mut wire, 1);
        wire.put_u8(MSG_AUDIO);
        wire.put_u8(0xCC);
        // fmt2 csid 4: delta=30
        wire.put_u8(0x84);
        write_u24(&mut wire, 30);
        wire.put_u8(0xDD);
        // fmt3 csid 4: everything inherited, delta 30 re-applied
        wire.put_u8(0xC4);
        wire.put_u8(0xEE);

        let mut dec = ChunkDecoder::new();
        let m1 = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!((m1.timestamp, m1.payload.len()), (1000, 2));
        let m2 = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!((m2.timestamp, m2.payload.len()), (1020, 1));
        let m3 = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!((m3.timestamp, m3.payload.len()), (1050, 1));
        let m4 = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!((m4.timestamp, m4.payload.len()), (1080, 1));
    }

    #[test]
    fn fmt3_midmessage_extended_ts_repeat_is_discarded() {
        // Message with extended timestamp split across two chunks where the
        // sender repeats the extended field on the continuation.
        let ts: u32 = 0x0100_0000;
        let mut wire = BytesMut::new();
        wire.put_u8(0x06); // fmt0 csid 6
        write_u24(&mut wire, 0xFF_FFFF);
        write_u24(&mut wire, 130); // two chunks at size 128
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_u32(ts);
        wire.put_slice(&vec![0x11; 128]);
        wire.put_u8(0xC6); // fmt3 continuation
        wire.put_u32(ts); // repeated extended timestamp
        wire.put_slice(&[0x22, 0x33]);

        let mut dec = ChunkDecoder::new();
        let msg = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(msg.timestamp, ts);
        assert_eq!(msg.payload.len(), 130);
        assert_eq!(&msg.payload[128..], &[0x22, 0x33]);
    }

    #[test]
    fn fmt3_midmessage_without_ext_repeat() {
        // Same as above but the sender does not repeat the extended field;
        // the first payload bytes of the continuation must not be eaten.
        let ts: u32 = 0x0100_0000;
        let mut wire = BytesMut::new();
        wire.put_u8(0x06);
        write_u24(&mut wire, 0xFF_FFFF);
        write_u24(&mut wire, 132);
        wire.put_u8(MSG_VIDEO);
        wire.put_u32_le(1);
        wire.put_u32(ts);
        wire.put_slice(&vec![0x11; 128]);
        wire.put_u8(0xC6);
        // Four payload bytes that do not match the timestamp.
        wire.put_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut dec = ChunkDecoder::new();
        let msg = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(msg.payload.len(), 132);
        assert_eq!(&msg.payload[128..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn interleaved_csids() {
        let audio = Message::new(MSG_AUDIO, 40, 1, Bytes::from(vec![0xA0; 200]));
        let video = Message::new(MSG_VIDEO, 40, 1, Bytes::from(vec![0xB0; 200]));

        // Chunk both, then interleave chunk-by-chunk.
        let enc = ChunkEncoder::new();
        let mut wa = BytesMut::new();
        let mut wv = BytesMut::new();
        enc.encode(&audio, CSID_AUDIO, &mut wa);
        enc.encode(&video, CSID_VIDEO, &mut wv);

        // audio chunk1 | video chunk1 | audio chunk2 | video chunk2
        let a1 = wa.split_to(1 + 11 + 128);
        let v1 = wv.split_to(1 + 11 + 128);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&a1);
        wire.extend_from_slice(&v1);
        wire.extend_from_slice(&wa);
        wire.extend_from_slice(&wv);

        let mut dec = ChunkDecoder::new();
        let m1 = dec.decode(&mut wire).unwrap().unwrap();
        let m2 = dec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(m1.type_id, MSG_AUDIO);
        assert_eq!(m1.payload.len(), 200);
        assert_eq!(m2.type_id, MSG_VIDEO);
        assert_eq!(m2.payload.len(), 200);
    }

    #[test]
    fn header_mid_message_is_fatal() {
        // Two-chunk message; the second chunk arrives as a fresh fmt-0
        // header instead of a fmt-3 continuation.
        let msg = Message::new(MSG_VIDEO, 7, 1, Bytes::from(vec![5u8; 256]));
        let mut wire = BytesMut::new();
        ChunkEncoder::new().encode(&msg, CSID_VIDEO, &mut wire);

        let mut dec = ChunkDecoder::new();
        let mut first_chunk = wire.split_to(1 + 11 + 128);
        assert!(dec.decode(&mut first_chunk).unwrap().is_none());

        let intruder = Message::new(MSG_VIDEO, 8, 1, Bytes::from(vec![6u8; 16]));
        let mut wire2 = BytesMut::new();
        ChunkEncoder::new().encode(&intruder, CSID_VIDEO, &mut wire2);
        assert!(dec.decode(&mut wire2).is_err());
    }

    #[test]
    fn continuation_without_seed_is_fatal() {
        let mut wire = BytesMut::new();
        wire.put_u8(0x44); // fmt1 on a csid never seen
        write_u24(&mut wire, 0);
        write_u24(&mut wire, 1);
        wire.put_u8(MSG_AUDIO);
        wire.put_u8(0x00);

        let mut dec = ChunkDecoder::new();
        assert!(dec.decode(&mut wire).is_err());
    }

    #[test]
    fn abort_discards_partial_message(){
        let msg = Message::new(MSG_VIDEO, 7, 1, Bytes::from(vec![5u8; 256]));
        let mut wire = BytesMut::new();
        ChunkEncoder::new().encode(&msg, CSID_VIDEO, &mut wire);

        let mut dec = ChunkDecoder::new();
        let mut first_chunk = wire.split_to(1 + 11 + 128);
        assert!(dec.decode(&mut first_chunk).unwrap().is_none());

        dec.abort(CSID_VIDEO);
        // A fresh fmt0 message decodes cleanly afterwards.
        let msg2 = Message::new(MSG_VIDEO, 8, 1, Bytes::from(vec![6u8; 16]));
        let mut wire2 = BytesMut::new();
        ChunkEncoder::new().encode(&msg2, CSID_VIDEO, &mut wire2);
        let out = dec.decode(&mut wire2).unwrap().unwrap();
        assert_eq!(out.payload.len(), 16);
    }

    #[test]
    fn csid_for_message_types() {
        assert_eq!(csid_for(MSG_AUDIO), 4);
        assert_eq!(csid_for(MSG_VIDEO), 6);
        assert_eq!(csid_for(MSG_DATA_AMF0), 5);
        assert_eq!(csid_for(MSG_COMMAND_AMF0), 3);
        assert_eq!(csid_for(MSG_SET_CHUNK_SIZE), 2);
    }
}
