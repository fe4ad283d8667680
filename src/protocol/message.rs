//! RTMP messages
//!
//! A message is the unit reassembled from chunks: a type id, a timestamp,
//! a message stream id and a payload. Protocol control messages (type ids
//! 1-6) get a typed codec here; command messages (AMF0 on 20, AMF3 on 17)
//! decode into [`Command`]; audio/video/data payloads pass through opaque.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::amf::{self, AmfValue};
use crate::error::{AmfError, ChunkError, Result};
use crate::protocol::constants::*;

/// A reassembled RTMP message
#[derive(Debug, Clone)]
pub struct Message {
    pub type_id: u8,
    pub timestamp: u32,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(type_id: u8, timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            type_id,
            timestamp,
            stream_id,
            payload,
        }
    }

    /// Audio, video or script-data message carrying media
    pub fn is_media(&self) -> bool {
        matches!(
            self.type_id,
            MSG_AUDIO | MSG_VIDEO | MSG_DATA_AMF0 | MSG_DATA_AMF3
        )
    }

    pub fn is_command(&self) -> bool {
        matches!(self.type_id, MSG_COMMAND_AMF0 | MSG_COMMAND_AMF3)
    }

    pub fn is_protocol_control(&self) -> bool {
        self.type_id >= MSG_SET_CHUNK_SIZE && self.type_id <= MSG_SET_PEER_BANDWIDTH
    }
}

/// User control event types (within message type 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event: u16, data: Bytes },
}

/// Protocol control messages (csid 2, message stream id 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    SetChunkSize(u32),
    Abort(u32),
    Acknowledgement(u32),
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { size: u32, limit_type: u8 },
}

impl ControlMessage {
    /// Decode a control message payload for the given type id
    pub fn decode(type_id: u8, mut payload: Bytes) -> Result<Self> {
        let need = |n: usize, payload: &Bytes| {
            if payload.remaining() < n {
                Err(ChunkError::Truncated)
            } else {
                Ok(())
            }
        };

        match type_id {
            MSG_SET_CHUNK_SIZE => {
                need(4, &payload)?;
                // Top bit is reserved and must be ignored.
                Ok(ControlMessage::SetChunkSize(payload.get_u32() & 0x7FFF_FFFF))
            }
            MSG_ABORT => {
                need(4, &payload)?;
                Ok(ControlMessage::Abort(payload.get_u32()))
            }
            MSG_ACK => {
                need(4, &payload)?;
                Ok(ControlMessage::Acknowledgement(payload.get_u32()))
            }
            MSG_USER_CONTROL => {
                need(2, &payload)?;
                let event = payload.get_u16();
                let ev = match event {
                    0 => {
                        need(4, &payload)?;
                        UserControlEvent::StreamBegin(payload.get_u32())
                    }
                    1 => {
                        need(4, &payload)?;
                        UserControlEvent::StreamEof(payload.get_u32())
                    }
                    2 => {
                        need(4, &payload)?;
                        UserControlEvent::StreamDry(payload.get_u32())
                    }
                    3 => {
                        need(8, &payload)?;
                        UserControlEvent::SetBufferLength {
                            stream_id: payload.get_u32(),
                            buffer_ms: payload.get_u32(),
                        }
                    }
                    4 => {
                        need(4, &payload)?;
                        UserControlEvent::StreamIsRecorded(payload.get_u32())
                    }
                    6 => {
                        need(4, &payload)?;
                        UserControlEvent::PingRequest(payload.get_u32())
                    }
                    7 => {
                        need(4, &payload)?;
                        UserControlEvent::PingResponse(payload.get_u32())
                    }
                    other => UserControlEvent::Unknown {
                        event: other,
                        data: payload.clone(),
                    },
                };
                Ok(ControlMessage::UserControl(ev))
            }
            MSG_WINDOW_ACK_SIZE => {
                need(4, &payload)?;
                Ok(ControlMessage::WindowAckSize(payload.get_u32()))
            }
            MSG_SET_PEER_BANDWIDTH => {
                need(5, &payload)?;
                Ok(ControlMessage::SetPeerBandwidth {
                    size: payload.get_u32(),
                    limit_type: payload.get_u8(),
                })
            }
            other => Err(ChunkError::InvalidFormat(other).into()),
        }
    }

    /// Encode into a ready-to-chunk message (timestamp 0, stream id 0)
    pub fn to_message(&self) -> Message {
        let mut buf = BytesMut::with_capacity(8);
        let type_id = match self {
            ControlMessage::SetChunkSize(n) => {
                buf.put_u32(*n & 0x7FFF_FFFF);
                MSG_SET_CHUNK_SIZE
            }
            ControlMessage::Abort(csid) => {
                buf.put_u32(*csid);
                MSG_ABORT
            }
            ControlMessage::Acknowledgement(n) => {
                buf.put_u32(*n);
                MSG_ACK
            }
            ControlMessage::UserControl(ev) => {
                match ev {
                    UserControlEvent::StreamBegin(id) => {
                        buf.put_u16(0);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamEof(id) => {
                        buf.put_u16(1);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::StreamDry(id) => {
                        buf.put_u16(2);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::SetBufferLength {
                        stream_id,
                        buffer_ms,
                    } => {
                        buf.put_u16(3);
                        buf.put_u32(*stream_id);
                        buf.put_u32(*buffer_ms);
                    }
                    UserControlEvent::StreamIsRecorded(id) => {
                        buf.put_u16(4);
                        buf.put_u32(*id);
                    }
                    UserControlEvent::PingRequest(t) => {
                        buf.put_u16(6);
                        buf.put_u32(*t);
                    }
                    UserControlEvent::PingResponse(t) => {
                        buf.put_u16(7);
                        buf.put_u32(*t);
                    }
                    UserControlEvent::Unknown { event, data } => {
                        buf.put_u16(*event);
                        buf.put_slice(data);
                    }
                }
                MSG_USER_CONTROL
            }
            ControlMessage::WindowAckSize(n) => {
                buf.put_u32(*n);
                MSG_WINDOW_ACK_SIZE
            }
            ControlMessage::SetPeerBandwidth { size, limit_type } => {
                buf.put_u32(*size);
                buf.put_u8(*limit_type);
                MSG_SET_PEER_BANDWIDTH
            }
        };

        Message::new(type_id, 0, 0, buf.freeze())
    }
}

/// A decoded NetConnection/NetStream command
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub transaction_id: f64,
    pub object: AmfValue,
    pub args: Vec<AmfValue>,
}

impl Command {
    pub fn new(name: impl Into<String>, transaction_id: f64) -> Self {
        Self {
            name: name.into(),
            transaction_id,
            object: AmfValue::Null,
            args: Vec::new(),
        }
    }

    pub fn with_object(mut self, object: AmfValue) -> Self {
        self.object = object;
        self
    }

    pub fn with_arg(mut self, arg: AmfValue) -> Self {
        self.args.push(arg);
        self
    }

    /// Decode a command payload. AMF3 commands (type id 17) carry a leading
    /// format byte followed by a plain AMF0 body, which is how encoders
    /// actually emit them.
    pub fn decode(message: &Message) -> Result<Self> {
        let mut payload = message.payload.clone();
        if message.type_id == MSG_COMMAND_AMF3 && payload.has_remaining() {
            payload.advance(1);
        }

        let mut values = amf::decode_all(&payload)?.into_iter();

        let name = match values.next() {
            Some(AmfValue::String(s)) => s,
            _ => return Err(AmfError::NotACommand.into()),
        };
        let transaction_id = match values.next() {
            Some(AmfValue::Number(n)) => n,
            // Some encoders omit the transaction id on notifications.
            Some(_) | None => 0.0,
        };
        let object = values.next().unwrap_or(AmfValue::Null);
        let args: Vec<AmfValue> = values.collect();

        Ok(Command {
            name,
            transaction_id,
            object,
            args,
        })
    }

    /// Encode as an AMF0 command message on the given stream id
    pub fn to_message(&self, stream_id: u32) -> Message {
        let mut values = Vec::with_capacity(3 + self.args.len());
        values.push(AmfValue::String(self.name.clone()));
        values.push(AmfValue::Number(self.transaction_id));
        values.push(self.object.clone());
        values.extend(self.args.iter().cloned());

        Message::new(MSG_COMMAND_AMF0, 0, stream_id, amf::encode_all(&values))
    }

    /// First string argument after the command object (stream name for
    /// `publish`/`play`)
    pub fn stream_name(&self) -> Option<&str> {
        self.args.first().and_then(|v| v.as_str())
    }
}
