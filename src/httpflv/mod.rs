//! HTTP-FLV egress
//!
//! `GET /<app>/<name>.flv` attaches a hub subscriber and streams a live
//! FLV file with chunked transfer encoding:
//!
//! ```text
//! 46 4C 56 01 05 00 00 00 09   file header (audio+video)
//! 00 00 00 00                  first prevTagSize
//! { tagType(1) dataSize(3) ts(3) tsExt(1) streamId(3)=0 data prevTagSize(4) }*
//! ```
//!
//! Script tags are reformed to drop the publisher's `@setDataFrame`
//! wrapper before delivery.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, Response, StatusCode, Uri};
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream;
use tower_http::cors::{Any, CorsLayer};

use crate::amf::{self, MetadataOp};
use crate::hub::entry::StreamWriter;
use crate::hub::packet::{Packet, StreamInfo};
use crate::hub::store::StreamHub;

const FLV_HEADER: [u8; 9] = [0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09];
const TAG_HEADER_LEN: usize = 11;

/// Serialises packets as FLV tags
#[derive(Debug, Default)]
pub struct FlvMuxer;

impl FlvMuxer {
    /// File header plus the leading zero prevTagSize
    pub fn file_header() -> Bytes {
        let mut buf = BytesMut::with_capacity(FLV_HEADER.len() + 4);
        buf.put_slice(&FLV_HEADER);
        buf.put_u32(0);
        buf.freeze()
    }

    /// One complete tag: 11-byte header, data, 4-byte prevTagSize
    pub fn encode_tag(packet: &Packet, out: &mut BytesMut) {
        let data_len = packet.data.len();
        let ts = packet.timestamp;

        out.reserve(TAG_HEADER_LEN + data_len + 4);
        out.put_u8(packet.type_id());
        out.put_u8((data_len >> 16) as u8);
        out.put_u8((data_len >> 8) as u8);
        out.put_u8(data_len as u8);
        out.put_u8((ts >> 16) as u8);
        out.put_u8((ts >> 8) as u8);
        out.put_u8(ts as u8);
        out.put_u8((ts >> 24) as u8);
        out.put_slice(&[0, 0, 0]); // stream id, always 0
        out.put_slice(&packet.data);
        out.put_u32((TAG_HEADER_LEN + data_len) as u32);
    }
}

/// Rewrite a metadata packet for subscriber delivery; non-metadata and
/// unparseable payloads pass through unchanged.
pub fn reform_for_delivery(packet: &Packet) -> Packet {
    if !packet.is_metadata() {
        return packet.clone();
    }
    match amf::reform_metadata(&packet.data, MetadataOp::Del) {
        Ok(data) => {
            let mut out = packet.clone();
            out.data = data;
            out
        }
        Err(_) => packet.clone(),
    }
}

/// HTTP-FLV surface over the hub
pub struct HttpFlvService {
    hub: Arc<StreamHub>,
}

impl HttpFlvService {
    pub fn new(hub: Arc<StreamHub>) -> Arc<Self> {
        Arc::new(Self { hub })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(get(handle))
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::GET])
                    .allow_origin(Any),
            )
            .with_state(self.clone())
    }
}

async fn handle(State(service): State<Arc<HttpFlvService>>, uri: Uri) -> Response<Body> {
    let path = uri.path();
    let key = match path.strip_suffix(".flv") {
        Some(p) => p.trim_start_matches('/').to_string(),
        None => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("not found"))
                .unwrap()
        }
    };

    if !service.hub.is_publishing(&key) {
        return Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(Body::from("no publisher"))
            .unwrap();
    }

    let info = StreamInfo::new(key.clone(), path.to_string(), nanoid::nanoid!(12));
    let writer = StreamWriter::new(info, service.hub.write_timeout());
    service.hub.handle_writer(writer.clone());
    tracing::info!(stream = %key, "http-flv subscriber attached");

    let body_stream = stream::unfold(
        (writer, true),
        |(writer, first)| async move {
            if first {
                return Some((Ok::<Bytes, std::io::Error>(FlvMuxer::file_header()), (writer, false)));
            }
            let packet = writer.recv().await?;
            let packet = reform_for_delivery(&packet);
            let mut buf = BytesMut::new();
            FlvMuxer::encode_tag(&packet, &mut buf);
            writer.liveness.touch();
            Some((Ok(buf.freeze()), (writer, false)))
        },
    );

    Response::builder()
        .header(header::CONTENT_TYPE, "video/x-flv")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(body_stream))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amf::AmfValue;
    use crate::hub::packet::test_support::*;

    #[test]
    fn file_header_layout() {
        let header = FlvMuxer::file_header();
        assert_eq!(
            &header[..],
            &[0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0, 0, 0, 0]
        );
    }

    #[test]
    fn tag_layout() {
        let packet = keyframe(0x0102_0304);
        let mut out = BytesMut::new();
        FlvMuxer::encode_tag(&packet, &mut out);

        assert_eq!(out[0], 9); // video tag
        let data_len = (usize::from(out[1]) << 16) | (usize::from(out[2]) << 8) | usize::from(out[3]);
        assert_eq!(data_len, packet.data.len());

        // 24-bit timestamp + extension byte carrying bits 31..24.
        assert_eq!(&out[4..7], &[0x02, 0x03, 0x04]);
        assert_eq!(out[7], 0x01);
        assert_eq!(&out[8..11], &[0, 0, 0]);

        // prevTagSize covers header + data.
        let total = out.len();
        let prev = u32::from_be_bytes([
            out[total - 4],
            out[total - 3],
            out[total - 2],
            out[total - 1],
        ]);
        assert_eq!(prev as usize, TAG_HEADER_LEN + data_len);
    }

    #[test]
    fn audio_tag_type() {
        let mut out = BytesMut::new();
        FlvMuxer::encode_tag(&audio_frame(10), &mut out);
        assert_eq!(out[0], 8);
    }

    #[test]
    fn metadata_reformed_on_delivery() {
        let payload = amf::encode_all(&[
            AmfValue::String("@setDataFrame".into()),
            AmfValue::String("onMetaData".into()),
            AmfValue::object([("width", AmfValue::from(640.0))]),
        ]);
        let packet = Packet::metadata(0, 1, payload);

        let reformed = reform_for_delivery(&packet);
        let values = amf::decode_all(&reformed.data).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(values.len(), 2);

        // Media passes through untouched.
        let video = keyframe(5);
        assert_eq!(reform_for_delivery(&video).data, video.data);
    }
}
