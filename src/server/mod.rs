//! Network front end

pub mod listener;

pub use listener::RtmpServer;
