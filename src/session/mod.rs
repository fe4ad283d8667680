//! Connection sessions
//!
//! The server-side state machine gluing the protocol layers to the hub.

pub mod server;

pub use server::{ServerSession, Services};
