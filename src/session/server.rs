//! Server-side session state machine
//!
//! Drives one accepted connection: handshake, then the command sequence
//! that decides the session's role.
//!
//! Publisher:
//! ```text
//! connect -> WindowAckSize + SetPeerBandwidth + SetChunkSize + _result
//! releaseStream / FCPublish   (acknowledged silently)
//! createStream -> _result(streamId)
//! publish(name) -> [channel-key auth] -> onStatus Publish.Start
//! then type 8/9/18 messages are media into the hub
//! ```
//!
//! Subscriber:
//! ```text
//! connect -> createStream -> play(name)
//!   -> StreamBegin, Play.Reset, Play.Start, |RtmpSampleAccess
//! then cached + live packets flow out
//! ```

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::amf::AmfValue;
use crate::channels::KeyStore;
use crate::config::Config;
use crate::dvr::FlvArchiver;
use crate::error::{Error, ProtocolError, Result};
use crate::hls::HlsService;
use crate::hub::entry::{PublisherHandle, StreamReader, StreamWriter};
use crate::hub::packet::{Packet, StreamInfo};
use crate::hub::store::StreamHub;
use crate::httpflv::reform_for_delivery;
use crate::protocol::chunk::{csid_for, ChunkDecoder, ChunkEncoder};
use crate::protocol::constants::*;
use crate::protocol::handshake::{Handshake, HandshakeRole};
use crate::protocol::message::{Command, ControlMessage, Message, UserControlEvent};

/// Shared collaborators handed to every session
pub struct Services {
    pub hub: Arc<StreamHub>,
    pub keystore: Arc<dyn KeyStore>,
    pub hls: Option<Arc<HlsService>>,
    pub archiver: Option<Arc<FlvArchiver>>,
    pub config: Arc<Config>,
}

/// What a handled command means for the session's main loop
enum Transition {
    Continue,
    Publish { key: String },
    Play { key: String },
    Close,
}

/// One accepted connection
pub struct ServerSession<S> {
    session_id: u64,
    peer: String,
    rd: ReadHalf<S>,
    wr: WriteHalf<S>,
    read_buf: BytesMut,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,

    /// Peer's acknowledgement window
    window_ack_size: u64,
    bytes_in: u64,
    last_ack: u64,

    app: String,
    services: Arc<Services>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> ServerSession<S> {
    pub fn new(stream: S, services: Arc<Services>, session_id: u64, peer: String) -> Self {
        let (rd, wr) = io::split(stream);
        Self {
            session_id,
            peer,
            rd,
            wr,
            read_buf: BytesMut::with_capacity(8 * 1024),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            window_ack_size: u64::from(DEFAULT_WINDOW_ACK_SIZE),
            bytes_in: 0,
            last_ack: 0,
            app: String::new(),
            services,
        }
    }

    /// Drive the connection to completion
    pub async fn run(mut self) -> Result<()> {
        self.handshake().await?;
        tracing::debug!(session_id = self.session_id, peer = %self.peer, "handshake complete");

        loop {
            while let Some(msg) = self.decoder.decode(&mut self.read_buf)? {
                match self.handle_message(msg).await? {
                    Transition::Continue => {}
                    Transition::Publish { key } => return self.publish_loop(key).await,
                    Transition::Play { key } => return self.play_loop(key).await,
                    Transition::Close => return Ok(()),
                }
            }

            let n = self.rd.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Ok(());
            }
            self.account_bytes(n).await?;
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut handshake = Handshake::new(HandshakeRole::Server);
        handshake.start();

        while !handshake.is_done() {
            if self.read_buf.len() >= handshake.bytes_needed() && !self.read_buf.is_empty() {
                let mut view = self.read_buf.split().freeze();
                if let Some(response) = handshake.advance(&mut view)? {
                    self.wr.write_all(&response).await?;
                }
                // Bytes past the handshake belong to the chunk layer.
                self.read_buf = BytesMut::from(&view[..]);
                continue;
            }
            let n = self.rd.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed.into());
            }
            self.bytes_in += n as u64;
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: Message) -> Result<Transition> {
        if msg.is_protocol_control() {
            self.on_control(&msg)?;
            return Ok(Transition::Continue);
        }
        if msg.is_command() {
            let cmd = Command::decode(&msg)?;
            return self.on_command(cmd).await;
        }
        if msg.is_media() {
            // Media before publish: the peer is out of order.
            return Err(ProtocolError::MediaBeforePublish.into());
        }
        tracing::debug!(type_id = msg.type_id, "ignoring message");
        Ok(Transition::Continue)
    }

    fn on_control(&mut self, msg: &Message) -> Result<()> {
        match ControlMessage::decode(msg.type_id, msg.payload.clone())? {
            ControlMessage::SetChunkSize(size) => {
                tracing::debug!(session_id = self.session_id, size, "peer chunk size");
                self.decoder.set_chunk_size(size);
            }
            ControlMessage::Abort(csid) => self.decoder.abort(csid),
            ControlMessage::WindowAckSize(size) => {
                self.window_ack_size = u64::from(size).max(1);
            }
            ControlMessage::Acknowledgement(_) | ControlMessage::SetPeerBandwidth { .. } => {}
            ControlMessage::UserControl(event) => {
                tracing::debug!(?event, "user control");
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<Transition> {
        tracing::debug!(session_id = self.session_id, command = %cmd.name, "command");
        match cmd.name.as_str() {
            "connect" => {
                self.on_connect(&cmd).await?;
                Ok(Transition::Continue)
            }
            "createStream" => {
                let result = Command::new("_result", cmd.transaction_id)
                    .with_arg(AmfValue::Number(f64::from(DEFAULT_STREAM_ID)));
                self.send_command(&result, 0).await?;
                Ok(Transition::Continue)
            }
            "publish" => self.on_publish(&cmd).await,
            "play" => self.on_play(&cmd).await,
            "releaseStream" | "FCPublish" | "FCUnpublish" | "getStreamLength" => {
                Ok(Transition::Continue)
            }
            "deleteStream" | "closeStream" => Ok(Transition::Close),
            other => {
                tracing::debug!(command = other, "unhandled command ignored");
                Ok(Transition::Continue)
            }
        }
    }

    async fn on_connect(&mut self, cmd: &Command) -> Result<()> {
        self.app = cmd
            .object
            .get_string("app")
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string();

        self.send_control(ControlMessage::WindowAckSize(DEFAULT_WINDOW_ACK_SIZE))
            .await?;
        self.send_control(ControlMessage::SetPeerBandwidth {
            size: DEFAULT_PEER_BANDWIDTH,
            limit_type: 2,
        })
        .await?;

        let chunk_size = self.services.config.chunk_size;
        self.send_control(ControlMessage::SetChunkSize(chunk_size))
            .await?;
        self.encoder.set_chunk_size(chunk_size);

        let result = Command::new("_result", cmd.transaction_id)
            .with_object(AmfValue::object([
                ("fmsVer", AmfValue::from("FMS/3,0,1,123")),
                ("capabilities", AmfValue::from(31.0)),
            ]))
            .with_arg(AmfValue::object([
                ("level", AmfValue::from("status")),
                ("code", AmfValue::from("NetConnection.Connect.Success")),
                ("description", AmfValue::from("Connection succeeded.")),
                ("objectEncoding", AmfValue::from(0.0)),
            ]));
        self.send_command(&result, 0).await?;

        tracing::info!(session_id = self.session_id, app = %self.app, "connected");
        Ok(())
    }

    /// Resolve the published name through the channel-key store. The last
    /// path segment of the name is the channel key; query parameters are
    /// not part of it.
    fn authenticate_publish(&self, name: &str) -> Result<String> {
        let name = name.split('?').next().unwrap_or(name);
        if self.services.config.rtmp_noauth {
            return Ok(name.to_string());
        }

        let key = name.rsplit('/').next().unwrap_or(name);
        self.services
            .keystore
            .get_channel(key)
            .ok_or_else(|| ProtocolError::BadName(name.to_string()).into())
    }

    async fn on_publish(&mut self, cmd: &Command) -> Result<Transition> {
        let name = cmd
            .stream_name()
            .ok_or_else(|| ProtocolError::MalformedCommand("publish".into()))?
            .to_string();

        let channel = match self.authenticate_publish(&name) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(session_id = self.session_id, name = %name, "publish rejected");
                self.send_status("error", "NetStream.Publish.BadName", "invalid stream key")
                    .await?;
                return Err(e);
            }
        };

        self.send_status("status", "NetStream.Publish.Start", "Start publishing")
            .await?;

        let key = format!("{}/{}", self.app, channel);
        tracing::info!(session_id = self.session_id, stream = %key, "publish started");
        Ok(Transition::Publish { key })
    }

    async fn on_play(&mut self, cmd: &Command) -> Result<Transition> {
        let name = cmd
            .stream_name()
            .ok_or_else(|| ProtocolError::MalformedCommand("play".into()))?
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string();

        self.send_control(ControlMessage::UserControl(UserControlEvent::StreamBegin(
            DEFAULT_STREAM_ID,
        )))
        .await?;
        self.send_status("status", "NetStream.Play.Reset", "Playing and resetting stream.")
            .await?;
        self.send_status("status", "NetStream.Play.Start", "Started playing stream.")
            .await?;

        // Grants script access to sample data; players expect it.
        let access = crate::amf::encode_all(&[
            AmfValue::String("|RtmpSampleAccess".into()),
            AmfValue::Boolean(false),
            AmfValue::Boolean(false),
        ]);
        self.send_message(&Message::new(MSG_DATA_AMF0, 0, DEFAULT_STREAM_ID, access))
            .await?;

        let key = format!("{}/{}", self.app, name);
        tracing::info!(session_id = self.session_id, stream = %key, "play started");
        Ok(Transition::Play { key })
    }

    /// Media ingest after a successful publish
    async fn publish_loop(mut self, key: String) -> Result<()> {
        let info = StreamInfo::new(
            key.clone(),
            format!("rtmp://{}/{}", self.peer, key),
            nanoid::nanoid!(12),
        );
        let (handle, reader) =
            StreamReader::channel(info, self.services.config.read_timeout());
        self.services.hub.handle_reader(reader);

        if let Some(hls) = &self.services.hls {
            hls.attach(&key);
        }
        if let Some(archiver) = &self.services.archiver {
            archiver
                .attach(&self.services.hub, &key, self.services.config.write_timeout())
                .await;
        }

        loop {
            while let Some(msg) = self.decoder.decode(&mut self.read_buf)? {
                if !self.on_publisher_message(msg, &handle).await? {
                    return Ok(());
                }
            }

            tokio::select! {
                _ = handle.evicted() => {
                    tracing::info!(session_id = self.session_id, stream = %key, "publisher replaced");
                    return Ok(());
                }
                result = self.rd.read_buf(&mut self.read_buf) => {
                    let n = result?;
                    if n == 0 {
                        tracing::info!(session_id = self.session_id, stream = %key, "publisher disconnected");
                        return Ok(());
                    }
                    self.account_bytes(n).await?;
                }
            }
        }
    }

    /// Returns false when the session should end
    async fn on_publisher_message(
        &mut self,
        msg: Message,
        handle: &PublisherHandle,
    ) -> Result<bool> {
        match msg.type_id {
            MSG_AUDIO | MSG_VIDEO | MSG_DATA_AMF0 | MSG_DATA_AMF3 => {
                let packet = match msg.type_id {
                    MSG_AUDIO => Packet::audio(msg.timestamp, msg.stream_id, msg.payload.clone()),
                    MSG_VIDEO => Packet::video(msg.timestamp, msg.stream_id, msg.payload.clone()),
                    _ => Ok(Packet::metadata(
                        msg.timestamp,
                        msg.stream_id,
                        msg.payload.clone(),
                    )),
                };
                match packet {
                    Ok(packet) => {
                        if handle.send(packet).await.is_err() {
                            return Ok(false);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(
                            session_id = self.session_id,
                            error = %e,
                            "malformed media packet discarded"
                        );
                    }
                }
                Ok(true)
            }
            _ if msg.is_protocol_control() => {
                self.on_control(&msg)?;
                Ok(true)
            }
            _ if msg.is_command() => {
                let cmd = Command::decode(&msg)?;
                match cmd.name.as_str() {
                    "deleteStream" | "closeStream" | "FCUnpublish" => Ok(false),
                    _ => Ok(true),
                }
            }
            _ => Ok(true),
        }
    }

    /// Media egress after a successful play
    async fn play_loop(mut self, key: String) -> Result<()> {
        let info = StreamInfo::new(
            key.clone(),
            format!("rtmp://{}/{}", self.peer, key),
            nanoid::nanoid!(12),
        );
        let writer = StreamWriter::new(info, self.services.config.write_timeout());
        self.services.hub.handle_writer(writer.clone());

        loop {
            tokio::select! {
                maybe = writer.recv() => {
                    match maybe {
                        Some(packet) => {
                            let packet = reform_for_delivery(&packet);
                            let msg = Message::new(
                                packet.type_id(),
                                packet.timestamp,
                                DEFAULT_STREAM_ID,
                                packet.data.clone(),
                            );
                            self.send_message(&msg).await?;
                            writer.liveness.touch();
                        }
                        None => {
                            tracing::info!(session_id = self.session_id, stream = %key, "subscriber stream ended");
                            return Ok(());
                        }
                    }
                }
                result = self.rd.read_buf(&mut self.read_buf) => {
                    let n = result?;
                    if n == 0 {
                        writer.close();
                        tracing::info!(session_id = self.session_id, stream = %key, "subscriber disconnected");
                        return Ok(());
                    }
                    self.account_bytes(n).await?;
                    while let Some(msg) = self.decoder.decode(&mut self.read_buf)? {
                        if !self.on_subscriber_message(msg)? {
                            writer.close();
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn on_subscriber_message(&mut self, msg: Message) -> Result<bool> {
        if msg.is_protocol_control() {
            self.on_control(&msg)?;
            return Ok(true);
        }
        if msg.is_command() {
            let cmd = Command::decode(&msg)?;
            return Ok(!matches!(cmd.name.as_str(), "deleteStream" | "closeStream"));
        }
        Ok(true)
    }

    /// Acknowledge received bytes once the peer's window is exceeded
    async fn account_bytes(&mut self, n: usize) -> Result<()> {
        self.bytes_in += n as u64;
        if self.bytes_in - self.last_ack >= self.window_ack_size {
            self.last_ack = self.bytes_in;
            self.send_control(ControlMessage::Acknowledgement(self.bytes_in as u32))
                .await?;
        }
        Ok(())
    }

    async fn send_message(&mut self, msg: &Message) -> Result<()> {
        let mut out = BytesMut::new();
        self.encoder.encode(msg, csid_for(msg.type_id), &mut out);
        self.wr.write_all(&out).await.map_err(Error::from)
    }

    async fn send_control(&mut self, control: ControlMessage) -> Result<()> {
        self.send_message(&control.to_message()).await
    }

    async fn send_command(&mut self, cmd: &Command, stream_id: u32) -> Result<()> {
        self.send_message(&cmd.to_message(stream_id)).await
    }

    async fn send_status(&mut self, level: &str, code: &str, description: &str) -> Result<()> {
        let status = Command::new("onStatus", 0.0).with_arg(AmfValue::object([
            ("level", AmfValue::from(level)),
            ("code", AmfValue::from(code)),
            ("description", AmfValue::from(description)),
        ]));
        self.send_command(&status, DEFAULT_STREAM_ID).await
    }
}
