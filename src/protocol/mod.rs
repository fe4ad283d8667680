//! Chunked publish/subscribe protocol
//!
//! The wire layers below the command state machine: handshake, chunk
//! framing with header compression, and typed message/control codecs.

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{csid_for, ChunkDecoder, ChunkEncoder};
pub use handshake::{Handshake, HandshakeRole};
pub use message::{Command, ControlMessage, Message, UserControlEvent};
