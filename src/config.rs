//! Server configuration
//!
//! One typed struct covering every tunable; listeners receive it by `Arc`
//! at construction. Loadable from a JSON file, with defaults matching a
//! bare `livecast` invocation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::hub::store::HubConfig;

fn default_rtmp_addr() -> SocketAddr {
    "0.0.0.0:1935".parse().unwrap()
}

fn default_httpflv_addr() -> SocketAddr {
    "0.0.0.0:7001".parse().unwrap()
}

fn default_hls_addr() -> SocketAddr {
    "0.0.0.0:7002".parse().unwrap()
}

fn default_gop_num() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_chunk_size() -> u32 {
    4096
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RTMP listen address
    pub rtmp_addr: SocketAddr,

    /// HTTP-FLV listen address
    pub httpflv_addr: SocketAddr,

    /// HLS listen address
    pub hls_addr: SocketAddr,

    /// GOPs retained for subscriber priming
    pub gop_num: usize,

    /// Publisher liveness timeout, seconds
    pub read_timeout: u64,

    /// Subscriber liveness timeout, seconds
    pub write_timeout: u64,

    /// Keep HLS sources and their segment windows after a publish ends
    pub hls_keep_after_end: bool,

    /// Accept any publish name instead of requiring channel keys
    pub rtmp_noauth: bool,

    /// Record publish sessions to FLV files
    pub flv_archive: bool,

    /// Directory for archived FLV files
    pub flv_dir: String,

    /// Chunk size announced to peers
    pub chunk_size: u32,

    /// Upstream push URLs per app: every stream published to the app is
    /// re-published to `<url>/<stream>`
    pub static_push: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rtmp_addr: default_rtmp_addr(),
            httpflv_addr: default_httpflv_addr(),
            hls_addr: default_hls_addr(),
            gop_num: default_gop_num(),
            read_timeout: default_timeout_secs(),
            write_timeout: default_timeout_secs(),
            hls_keep_after_end: false,
            rtmp_noauth: false,
            flv_archive: false,
            flv_dir: "tmp".to_string(),
            chunk_size: default_chunk_size(),
            static_push: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from a JSON file; missing fields fall back to defaults
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Hub tuning slice of the config
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            gop_num: self.gop_num,
            read_timeout: self.read_timeout(),
            write_timeout: self.write_timeout(),
        }
    }

    /// Push URLs configured for an app
    pub fn push_urls(&self, app: &str) -> Option<&Vec<String>> {
        self.static_push.get(app).filter(|urls| !urls.is_empty())
    }
}
