//! Stream hub: pub/sub routing for live media
//!
//! One publisher per stream key fans out to any number of subscribers.
//! Each subscriber owns a bounded queue with a media-aware drop policy, so
//! a slow consumer degrades alone. A per-stream cache primes late joiners
//! with a decodable prefix (metadata, sequence headers, last GOP).
//!
//! ```text
//!                       StreamHub (DashMap by "app/name")
//!                                   |
//!                          Stream entry ("live/demo")
//!          reader ----fan-out task----+--> writer queue --> RTMP player
//!        (publisher)      |           +--> writer queue --> HTTP-FLV
//!                     GopCache        +--> writer queue --> HLS source
//! ```

pub mod cache;
pub mod entry;
pub mod packet;
pub mod queue;
pub mod store;

pub use cache::GopCache;
pub use entry::{
    Liveness, PublisherHandle, PushRelay, Stream, StreamReader, StreamWriter,
    DEFAULT_ENDPOINT_TIMEOUT,
};
pub use packet::{Packet, PacketHeader, PacketKind, StreamInfo};
pub use queue::{PacketQueue, QUEUE_CAPACITY};
pub use store::{HubConfig, StreamHub, SWEEP_INTERVAL};
