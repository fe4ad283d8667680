//! Stream hub
//!
//! Keyed registry fanning one publisher to many subscribers per stream.
//! Entries are created on first publisher or subscriber arrival and
//! reaped by a 5-second sweeper once no live endpoint remains.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::hub::entry::{PushRelay, Stream, StreamReader, StreamWriter};

/// Sweep period for dead-endpoint collection
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Hub tuning, derived from `Config`
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// GOPs retained for subscriber priming
    pub gop_num: usize,
    /// Publisher liveness timeout
    pub read_timeout: Duration,
    /// Subscriber liveness timeout
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            gop_num: 1,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// The stream registry
pub struct StreamHub {
    streams: DashMap<String, Arc<Stream>>,
    config: HubConfig,
    relay: Option<Arc<dyn PushRelay>>,
}

impl StreamHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            config,
            relay: None,
        })
    }

    /// Hub with a static-push relay attached
    pub fn with_relay(config: HubConfig, relay: Arc<dyn PushRelay>) -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
            config,
            relay: Some(relay),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Bind a publisher to its key. An existing publisher with a different
    /// uid is stopped and its subscribers migrate to a fresh entry with
    /// their timestamps rebased.
    pub fn handle_reader(&self, reader: StreamReader) {
        let key = reader.info.key.clone();
        tracing::debug!(stream = %key, uid = %reader.info.uid, "handle_reader");

        let existing = self.streams.get(&key).map(|e| e.value().clone());

        let target = match existing {
            Some(current) => {
                current.trans_stop();
                let swapped = current
                    .reader_uid()
                    .map(|uid| !uid.is_empty() && uid != reader.info.uid)
                    .unwrap_or(false);
                if swapped {
                    let fresh = Stream::new(reader.info.clone(), self.config.gop_num);
                    current.migrate_writers_to(&fresh);
                    self.streams.insert(key, fresh.clone());
                    fresh
                } else {
                    current.set_info(reader.info.clone());
                    current
                }
            }
            None => {
                let fresh = Stream::new(reader.info.clone(), self.config.gop_num);
                self.streams.insert(key, fresh.clone());
                fresh
            }
        };

        target.attach_reader(reader, self.relay.clone());
    }

    /// Attach a subscriber to the entry for its key, creating an empty
    /// entry when none exists yet.
    pub fn handle_writer(&self, writer: Arc<StreamWriter>) {
        let key = writer.info.key.clone();
        tracing::debug!(stream = %key, uid = %writer.info.uid, "handle_writer");

        let entry = self
            .streams
            .entry(key)
            .or_insert_with(|| Stream::new(writer.info.clone(), self.config.gop_num));
        entry.add_writer(writer);
    }

    pub fn get(&self, key: &str) -> Option<Arc<Stream>> {
        self.streams.get(key).map(|e| e.value().clone())
    }

    /// A publisher is currently live on this key
    pub fn is_publishing(&self, key: &str) -> bool {
        self.get(key).map(|s| s.is_start()).unwrap_or(false)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// One sweep: prune dead endpoints, drop entries with none left
    pub fn check_alive(&self) {
        let mut remove: Vec<String> = Vec::new();
        for entry in self.streams.iter() {
            if entry.value().check_alive() == 0 {
                remove.push(entry.key().clone());
            }
        }
        for key in remove {
            tracing::info!(stream = %key, "stream collected");
            self.streams.remove(&key);
        }
    }

    /// Background sweeper; runs until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => hub.check_alive(),
                }
            }
        })
    }

    /// Read/write timeouts for endpoint construction
    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.config.write_timeout
    }
}
