//! Protocol constants

/// RTMP protocol version carried in C0/S0
pub const RTMP_VERSION: u8 = 3;

/// Size of the C1/S1/C2/S2 handshake packets
pub const HANDSHAKE_SIZE: usize = 1536;

/// Chunk size assumed before `SetChunkSize` is negotiated
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Largest message length the decoder accepts (24-bit length field)
pub const MAX_MESSAGE_LENGTH: u32 = 0xFF_FFFF;

/// Window acknowledgement size offered to peers
pub const DEFAULT_WINDOW_ACK_SIZE: u32 = 2_500_000;

/// Peer bandwidth advertised to peers
pub const DEFAULT_PEER_BANDWIDTH: u32 = 2_500_000;

// Chunk stream ids used on the outbound side. Protocol control is pinned
// to csid 2; the rest mirror common server behaviour.
pub const CSID_PROTOCOL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_AUDIO: u32 = 4;
pub const CSID_DATA: u32 = 5;
pub const CSID_VIDEO: u32 = 6;

// Message type ids
pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACK: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

/// Message stream id handed out by `createStream`
pub const DEFAULT_STREAM_ID: u32 = 1;
