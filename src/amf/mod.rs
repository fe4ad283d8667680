//! AMF0 value codec
//!
//! Command payloads and onMetaData scripts are sequences of AMF0 values.
//! [`reform_metadata`] rewrites a script payload between the publisher form
//! (`@setDataFrame` + `onMetaData` + object) and the subscriber form
//! (`onMetaData` + object): HTTP-FLV and archival strip the wrapper, the
//! static-push relay restores it.

pub mod amf0;
pub mod value;

pub use amf0::{decode, decode_all, encode, encode_all, Amf0Decoder, Amf0Encoder};
pub use value::AmfValue;

use bytes::Bytes;

use crate::error::AmfError;

const SET_DATA_FRAME: &str = "@setDataFrame";

/// Direction of a metadata rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataOp {
    /// Prepend `@setDataFrame` (outbound publish)
    Add,
    /// Strip `@setDataFrame` (delivery to subscribers)
    Del,
}

/// Rewrite an onMetaData script payload, returning the re-encoded bytes.
/// Payloads already in the requested form pass through re-encoded.
pub fn reform_metadata(data: &[u8], op: MetadataOp) -> Result<Bytes, AmfError> {
    let mut values = decode_all(data)?;

    let has_wrapper = matches!(
        values.first(),
        Some(AmfValue::String(s)) if s == SET_DATA_FRAME
    );

    match op {
        MetadataOp::Del => {
            if has_wrapper {
                values.remove(0);
            }
        }
        MetadataOp::Add => {
            if !has_wrapper {
                values.insert(0, AmfValue::String(SET_DATA_FRAME.into()));
            }
        }
    }

    Ok(encode_all(&values))
}
