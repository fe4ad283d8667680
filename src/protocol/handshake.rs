//! RTMP handshake
//!
//! Three-phase exchange before any chunk traffic:
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version) --------->|
//!   |------- C1 (1536 bytes: time+random) ->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (1536 bytes: time+random) --|
//!   |<------ S2 (1536 bytes: echo C1) ------|
//!   |------- C2 (1536 bytes: echo S1) ----->|
//! ```
//!
//! Only the simple handshake is implemented; the HMAC-SHA256 digest variant
//! is optional in the wild and not required by any encoder this server
//! targets. Version bytes >= 3 are accepted leniently.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

/// Which side of the handshake we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Nothing sent or received yet
    Initial,
    /// Waiting for the peer's version + first packet (C0C1 / S0S1S2)
    AwaitPeerPacket,
    /// Waiting for the peer's echo (C2, server only)
    AwaitPeerEcho,
    /// Exchange complete
    Done,
}

/// Handshake state machine, driven by `advance` as bytes arrive
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
        }
    }

    /// Handshake finished; chunk traffic may begin
    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Bytes the state machine needs before `advance` can make progress
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::AwaitPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::AwaitPeerPacket, HandshakeRole::Client) => 1 + 2 * HANDSHAKE_SIZE,
            (HandshakeState::AwaitPeerEcho, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// First bytes to put on the wire: C0+C1 for a client, nothing for a
    /// server (it speaks only after C0C1 arrives).
    pub fn start(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::AwaitPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&fill_packet());
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Consume peer bytes from `data`, returning bytes to send back (if
    /// any). Returns `Ok(None)` when more data is needed; call again once
    /// `bytes_needed` are buffered.
    pub fn advance(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        match self.state {
            HandshakeState::AwaitPeerPacket => self.on_peer_packet(data),
            HandshakeState::AwaitPeerEcho => self.on_peer_echo(data),
            _ => Ok(None),
        }
    }

    fn on_peer_packet(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        match self.role {
            HandshakeRole::Server => {
                if data.remaining() < 1 + HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let version = data.get_u8();
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version).into());
                }

                let mut c1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut c1);

                // S0 + S1 + S2 in one write
                let mut response = BytesMut::with_capacity(1 + 2 * HANDSHAKE_SIZE);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&fill_packet());
                response.put_slice(&echo_packet(&c1));

                self.state = HandshakeState::AwaitPeerEcho;
                Ok(Some(response.freeze()))
            }
            HandshakeRole::Client => {
                if data.remaining() < 1 + 2 * HANDSHAKE_SIZE {
                    return Ok(None);
                }

                let version = data.get_u8();
                if version < RTMP_VERSION {
                    return Err(HandshakeError::InvalidVersion(version).into());
                }

                let mut s1 = [0u8; HANDSHAKE_SIZE];
                data.copy_to_slice(&mut s1);

                // S2 is an echo of our C1; consume without verifying, some
                // servers do not echo faithfully.
                data.advance(HANDSHAKE_SIZE);

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&echo_packet(&s1))))
            }
        }
    }

    fn on_peer_echo(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        if data.remaining() < HANDSHAKE_SIZE {
            return Ok(None);
        }
        // C2 echoes our S1; consume without strict verification.
        data.advance(HANDSHAKE_SIZE);
        self.state = HandshakeState::Done;
        Ok(None)
    }
}

/// Build a C1/S1 packet: 4-byte time, 4 zero bytes, 1528 bytes of filler.
///
/// The filler only needs to be unpredictable enough to tell connections
/// apart; a seeded LCG is sufficient and keeps the dependency tree flat.
fn fill_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    packet[0..4].copy_from_slice(&timestamp.to_be_bytes());

    let mut seed = u64::from(timestamp) ^ 0x9E37_79B9_7F4A_7C15;
    for chunk in packet[8..].chunks_mut(8) {
        seed = seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }

    packet
}

/// Build a C2/S2 echo: peer's packet with our receive time in bytes 4..8.
fn echo_packet(peer: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0);

    echo[4..8].copy_from_slice(&timestamp.to_be_bytes());
    echo
}
