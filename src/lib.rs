//! # livecast
//!
//! Live-streaming relay core: ingests publish sessions over the RTMP
//! chunk protocol, fans them out through a concurrent stream hub, and
//! remuxes the container (never the codec) into segmented HLS, with
//! HTTP-FLV, FLV archival and static-push relay as further egress paths.
//!
//! ```text
//!  publisher --RTMP--> session --> hub entry --+--> RTMP player
//!                                  (GOP cache) +--> HTTP-FLV subscriber
//!                                              +--> HLS source -> .ts/.m3u8
//!                                              +--> FLV archive
//!                                              +--> static push upstream
//! ```
//!
//! The crate is transport-faithful: FLV-tagged media in, MPEG-TS out,
//! H.264 and AAC/MP3 passed through untouched.

pub mod amf;
pub mod channels;
pub mod config;
pub mod dvr;
pub mod error;
pub mod hls;
pub mod httpflv;
pub mod hub;
pub mod media;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
pub mod ts;

pub use channels::{KeyStore, MemoryKeyStore};
pub use config::Config;
pub use error::{Error, Result};
pub use hls::HlsService;
pub use hub::{StreamHub, StreamInfo};
pub use server::RtmpServer;
pub use session::Services;
