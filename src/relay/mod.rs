//! Static-push relay
//!
//! Re-publishes selected apps to upstream RTMP endpoints. The fan-out loop
//! hands every publisher packet to the manager, which feeds one outbound
//! publisher connection per configured push URL. Each pusher owns a
//! bounded queue with the standard drop policy, so a slow upstream sheds
//! like any other subscriber.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::amf::{self, AmfValue, MetadataOp};
use crate::config::Config;
use crate::error::{Error, ProtocolError, Result};
use crate::hub::entry::PushRelay;
use crate::hub::packet::{Packet, PacketKind};
use crate::hub::queue::PacketQueue;
use crate::protocol::chunk::{csid_for, ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{Command, ControlMessage, Message};

const DEFAULT_RTMP_PORT: u16 = 1935;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination parsed from `rtmp://host[:port]/app/stream`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub addr: String,
    pub app: String,
    pub stream: String,
}

impl PushTarget {
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("rtmp://")?;
        let (host, path) = rest.split_once('/')?;
        let (app, stream) = path.split_once('/')?;
        if app.is_empty() || stream.is_empty() {
            return None;
        }

        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{DEFAULT_RTMP_PORT}")
        };
        Some(Self {
            addr,
            app: app.to_string(),
            stream: stream.to_string(),
        })
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}/{}", self.addr, self.app)
    }
}

struct PusherSlot {
    queue: Arc<PacketQueue>,
    cancel: CancellationToken,
}

/// Keeps one outbound publisher per active push URL
pub struct StaticPushManager {
    config: Arc<Config>,
    pushers: DashMap<String, PusherSlot>,
}

impl StaticPushManager {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            pushers: DashMap::new(),
        })
    }

    /// Push URLs for a stream key (`app/name`)
    fn urls_for(&self, key: &str) -> Vec<String> {
        let Some((app, name)) = key.split_once('/') else {
            return Vec::new();
        };
        self.config
            .push_urls(app)
            .map(|urls| urls.iter().map(|u| format!("{u}/{name}")).collect())
            .unwrap_or_default()
    }

    pub fn pusher_count(&self) -> usize {
        self.pushers.len()
    }
}

impl PushRelay for StaticPushManager {
    fn has_push(&self, key: &str) -> bool {
        key.split_once('/')
            .map(|(app, _)| self.config.push_urls(app).is_some())
            .unwrap_or(false)
    }

    fn start(&self, key: &str) {
        for url in self.urls_for(key) {
            if self.pushers.contains_key(&url) {
                continue;
            }
            let Some(target) = PushTarget::parse(&url) else {
                tracing::warn!(%url, "invalid push url");
                continue;
            };

            tracing::info!(%url, "static push starting");
            let queue = Arc::new(PacketQueue::new());
            let cancel = CancellationToken::new();
            self.pushers.insert(
                url.clone(),
                PusherSlot {
                    queue: queue.clone(),
                    cancel: cancel.clone(),
                },
            );
            tokio::spawn(async move {
                if let Err(e) = run_pusher(target, queue, cancel).await {
                    tracing::warn!(%url, error = %e, "static push ended");
                }
            });
        }
    }

    fn stop(&self, key: &str) {
        for url in self.urls_for(key) {
            if let Some((_, slot)) = self.pushers.remove(&url) {
                tracing::info!(%url, "static push stopping");
                slot.cancel.cancel();
                slot.queue.close();
            }
        }
    }

    fn write(&self, key: &str, packet: Packet) {
        for url in self.urls_for(key) {
            if let Some(slot) = self.pushers.get(&url) {
                let _ = slot.queue.push(packet.clone());
            }
        }
    }
}

/// One outbound publish connection
async fn run_pusher(
    target: PushTarget,
    queue: Arc<PacketQueue>,
    cancel: CancellationToken,
) -> Result<()> {
    let socket = TcpStream::connect(&target.addr).await?;
    let (mut rd, mut wr) = io::split(socket);

    // Client handshake.
    let mut handshake = Handshake::new(HandshakeRole::Client);
    let c0c1 = handshake.start().expect("fresh handshake");
    wr.write_all(&c0c1).await?;

    let mut buf = BytesMut::with_capacity(8 * 1024);
    while !handshake.is_done() {
        if buf.len() >= handshake.bytes_needed() && !buf.is_empty() {
            let mut view = buf.split().freeze();
            if let Some(reply) = handshake.advance(&mut view)? {
                wr.write_all(&reply).await?;
            }
            buf = BytesMut::from(&view[..]);
            continue;
        }
        if rd.read_buf(&mut buf).await? == 0 {
            return Err(ProtocolError::ConnectionClosed.into());
        }
    }

    let mut decoder = ChunkDecoder::new();
    let mut encoder = ChunkEncoder::new();

    // connect
    let connect = Command::new("connect", 1.0).with_object(AmfValue::object([
        ("app", AmfValue::from(target.app.as_str())),
        ("type", AmfValue::from("nonprivate")),
        ("flashVer", AmfValue::from("FMLE/3.0 (compatible; livecast)")),
        ("tcUrl", AmfValue::from(target.tc_url())),
    ]));
    send(&mut wr, &encoder, &connect.to_message(0)).await?;
    await_command(&mut rd, &mut buf, &mut decoder, "_result").await?;

    // createStream
    let create = Command::new("createStream", 2.0);
    send(&mut wr, &encoder, &create.to_message(0)).await?;
    let result = await_command(&mut rd, &mut buf, &mut decoder, "_result").await?;
    let stream_id = result
        .args
        .first()
        .and_then(AmfValue::as_number)
        .unwrap_or(f64::from(DEFAULT_STREAM_ID)) as u32;

    // publish
    let publish = Command::new("publish", 3.0)
        .with_arg(AmfValue::from(target.stream.as_str()))
        .with_arg(AmfValue::from("live"));
    send(&mut wr, &encoder, &publish.to_message(stream_id)).await?;
    let status = await_command(&mut rd, &mut buf, &mut decoder, "onStatus").await?;
    let code = status
        .args
        .first()
        .and_then(|v| v.get_string("code"))
        .unwrap_or_default();
    if code != "NetStream.Publish.Start" {
        return Err(ProtocolError::UnexpectedCommand(code.to_string()).into());
    }

    tracing::info!(addr = %target.addr, app = %target.app, stream = %target.stream, "static push publishing");

    // Media loop: forward queue packets, drain inbound control traffic.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            maybe = queue.pop() => {
                let Some(packet) = maybe else { return Ok(()) };
                let packet = reform_for_push(&packet);
                let msg = Message::new(packet.type_id(), packet.timestamp, stream_id, packet.data.clone());
                send(&mut wr, &encoder, &msg).await?;
            }
            read = rd.read_buf(&mut buf) => {
                if read? == 0 {
                    return Err(ProtocolError::ConnectionClosed.into());
                }
                while let Some(msg) = decoder.decode(&mut buf)? {
                    if msg.type_id == MSG_SET_CHUNK_SIZE {
                        if let ControlMessage::SetChunkSize(size) =
                            ControlMessage::decode(msg.type_id, msg.payload.clone())?
                        {
                            decoder.set_chunk_size(size);
                        }
                    }
                }
            }
        }
    }
}

/// Metadata going upstream gets its `@setDataFrame` wrapper back
fn reform_for_push(packet: &Packet) -> Packet {
    if packet.kind != PacketKind::Metadata {
        return packet.clone();
    }
    match amf::reform_metadata(&packet.data, MetadataOp::Add) {
        Ok(data) => {
            let mut out = packet.clone();
            out.data = data;
            out
        }
        Err(_) => packet.clone(),
    }
}

async fn send<W: tokio::io::AsyncWrite + Unpin>(
    wr: &mut W,
    encoder: &ChunkEncoder,
    msg: &Message,
) -> Result<()> {
    let mut out = BytesMut::new();
    encoder.encode(msg, csid_for(msg.type_id), &mut out);
    wr.write_all(&out).await.map_err(Error::from)
}

async fn await_command<R: tokio::io::AsyncRead + Unpin>(
    rd: &mut R,
    buf: &mut BytesMut,
    decoder: &mut ChunkDecoder,
    name: &str,
) -> Result<Command> {
    let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
    loop {
        while let Some(msg) = decoder.decode(buf)? {
            if msg.type_id == MSG_SET_CHUNK_SIZE {
                if let ControlMessage::SetChunkSize(size) =
                    ControlMessage::decode(msg.type_id, msg.payload.clone())?
                {
                    decoder.set_chunk_size(size);
                }
                continue;
            }
            if msg.is_command() {
                let cmd = Command::decode(&msg)?;
                if cmd.name == name {
                    return Ok(cmd);
                }
            }
        }

        let read = tokio::time::timeout_at(deadline, rd.read_buf(buf))
            .await
            .map_err(|_| ProtocolError::UnexpectedCommand(format!("timeout waiting {name}")))?;
        if read? == 0 {
            return Err(ProtocolError::ConnectionClosed.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parse_push_urls() {
        let t = PushTarget::parse("rtmp://cdn.example.com/live/stream1").unwrap();
        assert_eq!(t.addr, "cdn.example.com:1935");
        assert_eq!(t.app, "live");
        assert_eq!(t.stream, "stream1");
        assert_eq!(t.tc_url(), "rtmp://cdn.example.com:1935/live");

        let t = PushTarget::parse("rtmp://10.0.0.1:19350/backup/demo").unwrap();
        assert_eq!(t.addr, "10.0.0.1:19350");

        assert!(PushTarget::parse("http://x/live/a").is_none());
        assert!(PushTarget::parse("rtmp://host/only-app").is_none());
        assert!(PushTarget::parse("rtmp://host//stream").is_none());
    }

    fn manager_with(app: &str, urls: Vec<&str>) -> Arc<StaticPushManager> {
        let config = Config {
            static_push: HashMap::from([(
                app.to_string(),
                urls.into_iter().map(String::from).collect(),
            )]),
            ..Config::default()
        };
        StaticPushManager::new(Arc::new(config))
    }

    #[test]
    fn has_push_checks_app() {
        let manager = manager_with("live", vec!["rtmp://upstream/live"]);
        assert!(manager.has_push("live/demo"));
        assert!(!manager.has_push("vod/demo"));
        assert!(!manager.has_push("nokey"));
    }

    #[test]
    fn urls_join_stream_name() {
        let manager = manager_with("live", vec!["rtmp://a/live", "rtmp://b/live"]);
        let urls = manager.urls_for("live/demo");
        assert_eq!(urls, vec!["rtmp://a/live/demo", "rtmp://b/live/demo"]);
    }

    #[tokio::test]
    async fn start_write_stop_lifecycle() {
        let manager = manager_with("live", vec!["rtmp://127.0.0.1:1/live"]);

        manager.start("live/demo");
        assert_eq!(manager.pusher_count(), 1);

        // Queue accepts writes even while the connection is failing.
        manager.write("live/demo", crate::hub::packet::test_support::keyframe(0));

        manager.stop("live/demo");
        assert_eq!(manager.pusher_count(), 0);
    }
}
