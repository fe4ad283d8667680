//! Error types
//!
//! Each subsystem has its own error enum; `Error` is the crate-wide union
//! used at task boundaries. Connection-fatal protocol errors bubble up to
//! the per-connection task, which closes the socket and detaches from the
//! hub; the hub itself keeps running.

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Amf(#[from] AmfError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Handshake failures
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported handshake version {0}")]
    InvalidVersion(u8),
}

/// Chunk-stream framing failures (fatal for the connection)
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("invalid chunk format {0}")]
    InvalidFormat(u8),

    #[error("continuation chunk without message in progress on csid {0}")]
    UnexpectedContinuation(u32),

    #[error("new message header on csid {0} before its message completed")]
    MessageInterrupted(u32),

    #[error("chunk data truncated")]
    Truncated,
}

/// AMF0 codec failures
#[derive(Debug, Error)]
pub enum AmfError {
    #[error("unexpected end of AMF data")]
    UnexpectedEof,

    #[error("unknown AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("missing object end marker")]
    InvalidObjectEnd,

    #[error("invalid UTF-8 in AMF string")]
    InvalidUtf8,

    #[error("invalid AMF reference index {0}")]
    InvalidReference(u16),

    #[error("AMF nesting too deep")]
    NestingTooDeep,

    #[error("payload is not a command")]
    NotACommand,
}

/// Media tag / bitstream parsing failures
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("invalid audio tag header")]
    InvalidAudioTag,

    #[error("invalid video tag header")]
    InvalidVideoTag,

    #[error("AVC end of sequence")]
    AvcEndOfSequence,

    #[error("invalid AVC decoder configuration")]
    InvalidAvcConfig,

    #[error("invalid NALU length")]
    InvalidNalu,

    #[error("invalid AudioSpecificConfig")]
    InvalidAacConfig,

    #[error("audio frame before AudioSpecificConfig")]
    MissingAacConfig,

    #[error("unsupported video codec {0}")]
    UnsupportedVideoCodec(u8),

    #[error("unsupported audio format {0}")]
    UnsupportedAudioFormat(u8),
}

impl MediaError {
    /// Errors that reject the whole stream rather than one packet
    pub fn is_codec_rejection(&self) -> bool {
        matches!(
            self,
            MediaError::UnsupportedVideoCodec(_) | MediaError::UnsupportedAudioFormat(_)
        )
    }
}

/// Protocol-level (command/session) failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected command {0:?}")]
    UnexpectedCommand(String),

    #[error("malformed command {0:?}")]
    MalformedCommand(String),

    #[error("publish rejected: bad name {0:?}")]
    BadName(String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("media message before publish")]
    MediaBeforePublish,
}

/// Stream hub failures
#[derive(Debug, Error)]
pub enum HubError {
    #[error("subscriber queue closed")]
    QueueClosed,
}
