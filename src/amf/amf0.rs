//! AMF0 encoder and decoder
//!
//! Type markers:
//! ```text
//! 0x00 Number   0x01 Boolean   0x02 String       0x03 Object
//! 0x05 Null     0x06 Undefined 0x07 Reference    0x08 ECMA Array
//! 0x09 ObjectEnd 0x0A StrictArray 0x0B Date      0x0C Long String
//! 0x0F XML      0x10 TypedObject
//! ```
//!
//! The decoder defaults to lenient mode: unknown markers decode as
//! Undefined and a missing object-end marker at end of input terminates the
//! object, both of which real encoders produce.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::value::AmfValue;
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_REFERENCE: u8 = 0x07;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;
const MARKER_UNSUPPORTED: u8 = 0x0D;
const MARKER_XML_DOCUMENT: u8 = 0x0F;
const MARKER_TYPED_OBJECT: u8 = 0x10;

/// Nesting cap guarding against stack exhaustion on hostile input
const MAX_NESTING_DEPTH: usize = 64;

/// AMF0 decoder
pub struct Amf0Decoder {
    /// Values seen so far, addressable by Reference markers
    references: Vec<AmfValue>,
    lenient: bool,
    depth: usize,
}

impl Amf0Decoder {
    pub fn new() -> Self {
        Self::with_lenient(true)
    }

    pub fn with_lenient(lenient: bool) -> Self {
        Self {
            references: Vec::new(),
            lenient,
            depth: 0,
        }
    }

    /// Reset reference bookkeeping between messages
    pub fn reset(&mut self) {
        self.references.clear();
        self.depth = 0;
    }

    /// Decode one value from the buffer
    pub fn decode(&mut self, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        if buf.is_empty() {
            return Err(AmfError::UnexpectedEof);
        }

        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(AmfError::NestingTooDeep);
        }

        let marker = buf.get_u8();
        let result = self.decode_value(marker, buf);
        self.depth -= 1;
        result
    }

    /// Decode values until the buffer is exhausted
    pub fn decode_all(&mut self, buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
        let mut values = Vec::new();
        while buf.has_remaining() {
            values.push(self.decode(buf)?);
        }
        Ok(values)
    }

    fn decode_value(&mut self, marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
        match marker {
            MARKER_NUMBER => {
                if buf.remaining() < 8 {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Number(buf.get_f64()))
            }
            MARKER_BOOLEAN => {
                if buf.is_empty() {
                    return Err(AmfError::UnexpectedEof);
                }
                Ok(AmfValue::Boolean(buf.get_u8() != 0))
            }
            MARKER_STRING => Ok(AmfValue::String(self.read_utf8(buf)?)),
            MARKER_LONG_STRING => Ok(AmfValue::String(self.read_utf8_long(buf)?)),
            MARKER_OBJECT => {
                let props = self.decode_properties(buf)?;
                let obj = AmfValue::Object(props);
                self.references.push(obj.clone());
                Ok(obj)
            }
            MARKER_NULL => Ok(AmfValue::Null),
            MARKER_UNDEFINED | MARKER_UNSUPPORTED => Ok(AmfValue::Undefined),
            MARKER_REFERENCE => {
                if buf.remaining() < 2 {
                    return Err(AmfError::UnexpectedEof);
                }
                let index = buf.get_u16();
                self.references
                    .get(index as usize)
                    .cloned()
                    .ok_or(AmfError::InvalidReference(index))
            }
            MARKER_ECMA_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                // Length prefix is a hint only; properties are terminated
                // by the object-end marker like a plain object.
                let _count = buf.get_u32();
                let props = self.decode_properties(buf)?;
                let arr = AmfValue::EcmaArray(props);
                self.references.push(arr.clone());
                Ok(arr)
            }
            MARKER_STRICT_ARRAY => {
                if buf.remaining() < 4 {
                    return Err(AmfError::UnexpectedEof);
                }
                let count = buf.get_u32() as usize;
                let mut elements = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    elements.push(self.decode(buf)?);
                }
                let arr = AmfValue::Array(elements);
                self.references.push(arr.clone());
                Ok(arr)
            }
            MARKER_DATE => {
                if buf.remaining() < 10 {
                    return Err(AmfError::UnexpectedEof);
                }
                let timestamp = buf.get_f64();
                let _timezone = buf.get_i16();
                Ok(AmfValue::Date(timestamp))
            }
            MARKER_XML_DOCUMENT => Ok(AmfValue::Xml(self.read_utf8_long(buf)?)),
            MARKER_TYPED_OBJECT => {
                let class_name = self.read_utf8(buf)?;
                let properties = self.decode_properties(buf)?;
                let obj = AmfValue::TypedObject {
                    class_name,
                    properties,
                };
                self.references.push(obj.clone());
                Ok(obj)
            }
            other => {
                if self.lenient {
                    Ok(AmfValue::Undefined)
                } else {
                    Err(AmfError::UnknownMarker(other))
                }
            }
        }
    }

    /// Key/value pairs up to the object-end marker
    fn decode_properties(
        &mut self,
        buf: &mut Bytes,
    ) -> Result<HashMap<String, AmfValue>, AmfError> {
        let mut properties = HashMap::new();

        loop {
            let key = self.read_utf8(buf)?;

            if key.is_empty() {
                if buf.is_empty() {
                    if self.lenient {
                        // Some encoders truncate the trailing end marker.
                        break;
                    }
                    return Err(AmfError::UnexpectedEof);
                }
                let end_marker = buf.get_u8();
                if end_marker == MARKER_OBJECT_END || self.lenient {
                    break;
                }
                return Err(AmfError::InvalidObjectEnd);
            }

            let value = self.decode(buf)?;
            properties.insert(key, value);
        }

        Ok(properties)
    }

    fn read_utf8(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        if buf.remaining() < 2 {
            return Err(AmfError::UnexpectedEof);
        }
        let len = buf.get_u16() as usize;
        if buf.remaining() < len {
            return Err(AmfError::UnexpectedEof);
        }
        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
    }

    fn read_utf8_long(&mut self, buf: &mut Bytes) -> Result<String, AmfError> {
        if buf.remaining() < 4 {
            return Err(AmfError::UnexpectedEof);
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(AmfError::UnexpectedEof);
        }
        let bytes = buf.copy_to_bytes(len);
        String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
    }
}

impl Default for Amf0Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// AMF0 encoder accumulating into an internal buffer
pub struct Amf0Encoder {
    buf: BytesMut,
}

impl Amf0Encoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Take the encoded bytes, resetting the encoder
    pub fn finish(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn encode(&mut self, value: &AmfValue) {
        match value {
            AmfValue::Null => self.buf.put_u8(MARKER_NULL),
            AmfValue::Undefined => self.buf.put_u8(MARKER_UNDEFINED),
            AmfValue::Boolean(b) => {
                self.buf.put_u8(MARKER_BOOLEAN);
                self.buf.put_u8(u8::from(*b));
            }
            AmfValue::Number(n) => {
                self.buf.put_u8(MARKER_NUMBER);
                self.buf.put_f64(*n);
            }
            AmfValue::String(s) => {
                if s.len() > 0xFFFF {
                    self.buf.put_u8(MARKER_LONG_STRING);
                    self.buf.put_u32(s.len() as u32);
                    self.buf.put_slice(s.as_bytes());
                } else {
                    self.buf.put_u8(MARKER_STRING);
                    self.write_utf8(s);
                }
            }
            AmfValue::Object(props) => {
                self.buf.put_u8(MARKER_OBJECT);
                self.write_properties(props);
            }
            AmfValue::EcmaArray(props) => {
                self.buf.put_u8(MARKER_ECMA_ARRAY);
                self.buf.put_u32(props.len() as u32);
                self.write_properties(props);
            }
            AmfValue::Array(elements) => {
                self.buf.put_u8(MARKER_STRICT_ARRAY);
                self.buf.put_u32(elements.len() as u32);
                for elem in elements {
                    self.encode(elem);
                }
            }
            AmfValue::TypedObject {
                class_name,
                properties,
            } => {
                self.buf.put_u8(MARKER_TYPED_OBJECT);
                self.write_utf8(class_name);
                self.write_properties(properties);
            }
            AmfValue::Date(timestamp) => {
                self.buf.put_u8(MARKER_DATE);
                self.buf.put_f64(*timestamp);
                self.buf.put_i16(0);
            }
            AmfValue::Xml(s) => {
                self.buf.put_u8(MARKER_XML_DOCUMENT);
                self.buf.put_u32(s.len() as u32);
                self.buf.put_slice(s.as_bytes());
            }
        }
    }

    pub fn encode_all(&mut self, values: &[AmfValue]) {
        for value in values {
            self.encode(value);
        }
    }

    fn write_properties(&mut self, props: &HashMap<String, AmfValue>) {
        for (key, val) in props {
            self.write_utf8(key);
            self.encode(val);
        }
        self.buf.put_u16(0);
        self.buf.put_u8(MARKER_OBJECT_END);
    }

    fn write_utf8(&mut self, s: &str) {
        let len = s.len().min(0xFFFF);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(&s.as_bytes()[..len]);
    }
}

impl Default for Amf0Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a single value
pub fn encode(value: &AmfValue) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode(value);
    encoder.finish()
}

/// Encode a value sequence (command payloads)
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut encoder = Amf0Encoder::new();
    encoder.encode_all(values);
    encoder.finish()
}

/// Decode a single value
pub fn decode(data: &[u8]) -> Result<AmfValue, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode(&mut buf)
}

/// Decode every value in the buffer (command payloads)
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut decoder = Amf0Decoder::new();
    let mut buf = Bytes::copy_from_slice(data);
    decoder.decode_all(&mut buf)
}
