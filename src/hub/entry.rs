//! Stream entries and endpoint handles
//!
//! A `Stream` is one hub entry: at most one reader (the publisher), any
//! number of writers (subscribers), and a packet cache. The fan-out task
//! owned by the active reader delivers reader-observed order to every
//! primed writer; a writer sees the cache (metadata, sequence headers,
//! retained GOP) before its first live packet.
//!
//! Readers and writers carry a liveness stamp refreshed on activity; the
//! hub sweeper closes endpoints whose stamp goes stale.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;
use crate::hub::cache::GopCache;
use crate::hub::packet::{Packet, PacketKind, StreamInfo};
use crate::hub::queue::{PacketQueue, QUEUE_CAPACITY};

/// Default endpoint timeout; `Config` overrides per direction
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Activity stamp shared between an endpoint and the hub sweeper
#[derive(Debug)]
pub struct Liveness {
    last: Mutex<Instant>,
    timeout: Duration,
}

impl Liveness {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            last: Mutex::new(Instant::now()),
            timeout,
        })
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn alive(&self) -> bool {
        self.last.lock().unwrap().elapsed() < self.timeout
    }
}

/// Producer half of a publisher: owned by the ingest session
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<Packet>,
    pub liveness: Arc<Liveness>,
    cancel: CancellationToken,
}

impl PublisherHandle {
    /// Feed one packet toward the fan-out; refreshes liveness
    pub async fn send(&self, packet: Packet) -> Result<(), HubError> {
        self.liveness.touch();
        self.tx
            .send(packet)
            .await
            .map_err(|_| HubError::QueueClosed)
    }

    /// True once the hub evicted this publisher (a newer one took the key)
    pub fn is_evicted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the hub evicts this publisher
    pub async fn evicted(&self) {
        self.cancel.cancelled().await
    }
}

/// Consumer half of a publisher: handed to the hub, drained by fan-out
#[derive(Debug)]
pub struct StreamReader {
    pub info: StreamInfo,
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    pub liveness: Arc<Liveness>,
    cancel: CancellationToken,
}

impl StreamReader {
    /// Create a publisher channel pair
    pub fn channel(info: StreamInfo, timeout: Duration) -> (PublisherHandle, StreamReader) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let liveness = Liveness::new(timeout);
        let cancel = CancellationToken::new();

        let handle = PublisherHandle {
            tx,
            liveness: liveness.clone(),
            cancel: cancel.clone(),
        };
        let reader = StreamReader {
            info,
            rx: tokio::sync::Mutex::new(rx),
            liveness,
            cancel,
        };
        (handle, reader)
    }

    /// Next packet from the publisher; `None` on close or eviction
    pub async fn read(&self) -> Option<Packet> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            packet = rx.recv() => packet,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// A subscriber endpoint: bounded queue plus timestamp rebasing state
#[derive(Debug)]
pub struct StreamWriter {
    pub info: StreamInfo,
    queue: PacketQueue,
    pub liveness: Arc<Liveness>,
    base_timestamp: AtomicU32,
    last_video_ts: AtomicU32,
    last_audio_ts: AtomicU32,
}

impl StreamWriter {
    pub fn new(info: StreamInfo, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            info,
            queue: PacketQueue::new(),
            liveness: Liveness::new(timeout),
            base_timestamp: AtomicU32::new(0),
            last_video_ts: AtomicU32::new(0),
            last_audio_ts: AtomicU32::new(0),
        })
    }

    /// Enqueue a packet for this subscriber, rebasing its timestamp.
    /// Called by the fan-out task; never blocks.
    pub fn write(&self, packet: &Packet) -> Result<(), HubError> {
        let base = self.base_timestamp.load(Ordering::Relaxed);
        let mut out = packet.clone();
        out.timestamp = packet.timestamp.wrapping_add(base);

        match out.kind {
            PacketKind::Video => self.last_video_ts.store(out.timestamp, Ordering::Relaxed),
            PacketKind::Audio => self.last_audio_ts.store(out.timestamp, Ordering::Relaxed),
            PacketKind::Metadata => {}
        }

        let dropped = self.queue.push(out)?;
        if dropped > 0 {
            tracing::warn!(
                stream = %self.info.key,
                uid = %self.info.uid,
                dropped,
                "subscriber queue saturated, shed packets"
            );
        }
        Ok(())
    }

    /// Dequeue the next packet; consumer side. Refresh `liveness` after the
    /// packet is actually delivered downstream.
    pub async fn recv(&self) -> Option<Packet> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<Packet> {
        self.queue.try_pop()
    }

    /// Record the rebase offset applied to packets from the next reader:
    /// the largest timestamp delivered so far, so output stays monotonic
    /// across publisher swaps.
    pub fn rebase(&self) {
        let v = self.last_video_ts.load(Ordering::Relaxed);
        let a = self.last_audio_ts.load(Ordering::Relaxed);
        self.base_timestamp.store(v.max(a), Ordering::Relaxed);
    }

    pub fn base_timestamp(&self) -> u32 {
        self.base_timestamp.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Static-push seam: the fan-out forwards publisher packets to an upstream
/// relay when one is configured for the stream's app.
pub trait PushRelay: Send + Sync {
    /// Whether this key has configured push targets
    fn has_push(&self, key: &str) -> bool;
    /// Bring up relay connections for the key
    fn start(&self, key: &str);
    /// Tear down relay connections for the key
    fn stop(&self, key: &str);
    /// Forward one packet; best-effort
    fn write(&self, key: &str, packet: Packet);
}

#[derive(Debug)]
struct ReaderSlot {
    uid: String,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
}

pub(crate) struct WriterSlot {
    pub writer: Arc<StreamWriter>,
    pub primed: bool,
}

/// One hub entry
pub struct Stream {
    info: Mutex<StreamInfo>,
    pub(crate) writers: DashMap<String, WriterSlot>,
    reader: Mutex<Option<ReaderSlot>>,
    is_start: AtomicBool,
    /// Bumped on every reader attach; a fan-out only runs its exit
    /// cleanup when it is still the current generation
    epoch: AtomicU64,
    gop_num: usize,
}

impl Stream {
    pub fn new(info: StreamInfo, gop_num: usize) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(info),
            writers: DashMap::new(),
            reader: Mutex::new(None),
            is_start: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            gop_num,
        })
    }

    pub fn info(&self) -> StreamInfo {
        self.info.lock().unwrap().clone()
    }

    pub fn set_info(&self, info: StreamInfo) {
        *self.info.lock().unwrap() = info;
    }

    /// Uid of the currently attached reader, if any
    pub fn reader_uid(&self) -> Option<String> {
        self.reader.lock().unwrap().as_ref().map(|r| r.uid.clone())
    }

    /// A publisher is attached and its fan-out is running
    pub fn is_start(&self) -> bool {
        self.is_start.load(Ordering::Acquire)
    }

    pub fn add_writer(&self, writer: Arc<StreamWriter>) {
        let uid = writer.info.uid.clone();
        tracing::debug!(stream = %writer.info.key, uid = %uid, "writer attached");
        self.writers.insert(
            uid,
            WriterSlot {
                writer,
                primed: false,
            },
        );
    }

    pub fn writer_count(&self) -> usize {
        self.writers.len()
    }

    /// Stop the current reader; its fan-out loop exits on the next packet
    pub fn trans_stop(&self) {
        if let Some(slot) = self.reader.lock().unwrap().as_ref() {
            if self.is_start() {
                tracing::debug!(uid = %slot.uid, "stopping previous publisher");
                slot.cancel.cancel();
            }
        }
        self.is_start.store(false, Ordering::Release);
    }

    /// Move all writers to `dst`, recording each writer's rebase offset so
    /// timestamps stay monotonic under the replacement reader.
    pub fn migrate_writers_to(&self, dst: &Stream) {
        let uids: Vec<String> = self.writers.iter().map(|e| e.key().clone()).collect();
        for uid in uids {
            if let Some((_, slot)) = self.writers.remove(&uid) {
                slot.writer.rebase();
                dst.add_writer(slot.writer);
            }
        }
    }

    /// Attach a publisher and start its fan-out task
    pub fn attach_reader(self: &Arc<Self>, reader: StreamReader, relay: Option<Arc<dyn PushRelay>>) {
        {
            let mut guard = self.reader.lock().unwrap();
            *guard = Some(ReaderSlot {
                uid: reader.info.uid.clone(),
                liveness: reader.liveness.clone(),
                cancel: reader.cancel.clone(),
            });
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.is_start.store(true, Ordering::Release);

        let stream = self.clone();
        tokio::spawn(async move {
            stream.run_fanout(reader, relay, epoch).await;
        });
    }

    async fn run_fanout(
        self: Arc<Self>,
        reader: StreamReader,
        relay: Option<Arc<dyn PushRelay>>,
        epoch: u64,
    ) {
        let key = reader.info.key.clone();
        tracing::info!(stream = %key, uid = %reader.info.uid, "fan-out started");

        let pushing = relay.as_deref().map(|r| r.has_push(&key)).unwrap_or(false);
        if pushing {
            if let Some(r) = &relay {
                r.start(&key);
            }
        }

        let mut cache = GopCache::new(self.gop_num);

        while let Some(packet) = reader.read().await {
            reader.liveness.touch();

            if pushing {
                if let Some(r) = &relay {
                    r.write(&key, packet.clone());
                }
            }

            cache.write(&packet);

            let mut dead: Vec<String> = Vec::new();
            for mut slot in self.writers.iter_mut() {
                if !slot.primed {
                    // Prime with the cache; the packet just observed is
                    // already its newest element.
                    let ok = cache
                        .priming_packets()
                        .all(|cached| slot.writer.write(cached).is_ok());
                    if ok {
                        slot.primed = true;
                    } else {
                        dead.push(slot.key().clone());
                    }
                } else if slot.writer.write(&packet).is_err() {
                    dead.push(slot.key().clone());
                }
            }
            for uid in dead {
                tracing::debug!(stream = %key, uid = %uid, "removing dead writer");
                self.writers.remove(&uid);
            }
        }

        if pushing {
            if let Some(r) = &relay {
                r.stop(&key);
            }
        }

        // A replacement reader may already be attached (same key, new
        // publisher); only the current generation runs exit cleanup.
        if self.epoch.load(Ordering::Acquire) == epoch {
            self.is_start.store(false, Ordering::Release);

            // Server-internal writers follow their publisher down; external
            // subscribers stay until their own liveness expires.
            let internal: Vec<String> = self
                .writers
                .iter()
                .filter(|e| e.writer.info.internal)
                .map(|e| e.key().clone())
                .collect();
            for uid in internal {
                if let Some((_, slot)) = self.writers.remove(&uid) {
                    slot.writer.close();
                }
            }
        }

        tracing::info!(stream = %key, "fan-out stopped");
    }

    /// Prune dead endpoints; returns how many live ones remain
    pub fn check_alive(&self) -> usize {
        let mut alive = 0;

        {
            let guard = self.reader.lock().unwrap();
            if let Some(slot) = guard.as_ref() {
                if self.is_start() {
                    if slot.liveness.alive() {
                        alive += 1;
                    } else {
                        tracing::info!(uid = %slot.uid, "publisher timed out");
                        slot.cancel.cancel();
                    }
                }
            }
        }

        let mut dead: Vec<String> = Vec::new();
        for slot in self.writers.iter() {
            if slot.writer.liveness.alive() && !slot.writer.is_closed() {
                alive += 1;
            } else {
                dead.push(slot.key().clone());
            }
        }
        for uid in dead {
            if let Some((_, slot)) = self.writers.remove(&uid) {
                tracing::info!(uid = %uid, "subscriber timed out");
                slot.writer.close();
            }
        }

        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::packet::test_support::*;

    fn info(key: &str, uid: &str) -> StreamInfo {
        StreamInfo::new(key, format!("rtmp://localhost/{key}"), uid)
    }

    #[tokio::test]
    async fn reader_channel_delivers() {
        let (handle, reader) = StreamReader::channel(info("live/a", "r1"), Duration::from_secs(10));
        handle.send(audio_frame(1)).await.unwrap();

        let got = reader.read().await.unwrap();
        assert_eq!(got.timestamp, 1);
    }

    #[tokio::test]
    async fn reader_close_unblocks() {
        let (_handle, reader) =
            StreamReader::channel(info("live/a", "r1"), Duration::from_secs(10));
        reader.close();
        assert!(reader.read().await.is_none());
    }

    #[test]
    fn writer_rebases_timestamps() {
        let writer = StreamWriter::new(info("live/a", "w1"), Duration::from_secs(10));
        writer.write(&keyframe(100)).unwrap();
        writer.write(&audio_frame(90)).unwrap();

        writer.rebase();
        assert_eq!(writer.base_timestamp(), 100);

        // A new source restarting at zero continues from the base.
        writer.write(&keyframe(0)).unwrap();
        let mut last = None;
        while let Some(p) = writer.try_recv() {
            last = Some(p);
        }
        assert_eq!(last.unwrap().timestamp, 100);
    }

    #[test]
    fn liveness_expiry() {
        let live = Liveness::new(Duration::from_millis(0));
        assert!(!live.alive());

        let live = Liveness::new(Duration::from_secs(60));
        assert!(live.alive());
    }

    #[tokio::test]
    async fn fanout_primes_late_writer_with_cache() {
        let stream = Stream::new(info("live/a", ""), 1);
        let (handle, reader) =
            StreamReader::channel(info("live/a", "pub1"), Duration::from_secs(10));
        stream.attach_reader(reader, None);

        // Publisher sends config + keyframe + five inter frames.
        handle.send(video_seq_header(0)).await.unwrap();
        handle.send(audio_seq_header(0)).await.unwrap();
        handle.send(keyframe(10)).await.unwrap();
        for i in 0..5 {
            handle.send(inter_frame(20 + i * 10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Late joiner attaches mid-GOP.
        let writer = StreamWriter::new(info("live/a", "sub1"), Duration::from_secs(10));
        stream.add_writer(writer.clone());

        handle.send(inter_frame(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = writer.recv().await.unwrap();
        let second = writer.recv().await.unwrap();
        let third = writer.recv().await.unwrap();
        assert!(first.is_video_seq_header());
        assert!(second.is_audio_seq_header());
        assert!(third.is_key_frame());
    }

    #[tokio::test]
    async fn fanout_exit_closes_internal_writers() {
        let stream = Stream::new(info("live/a", ""), 1);
        let (handle, reader) =
            StreamReader::channel(info("live/a", "pub1"), Duration::from_secs(10));
        stream.attach_reader(reader, None);

        let external = StreamWriter::new(info("live/a", "viewer"), Duration::from_secs(10));
        let internal =
            StreamWriter::new(info("live/a", "hls").internal(), Duration::from_secs(10));
        stream.add_writer(external.clone());
        stream.add_writer(internal.clone());

        handle.send(keyframe(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!stream.is_start());
        assert!(internal.is_closed());
        assert!(!external.is_closed());
        assert_eq!(stream.writer_count(), 1);
    }

    #[tokio::test]
    async fn check_alive_counts_endpoints() {
        let stream = Stream::new(info("live/a", ""), 1);
        assert_eq!(stream.check_alive(), 0);

        let writer = StreamWriter::new(info("live/a", "w1"), Duration::from_secs(60));
        stream.add_writer(writer.clone());
        assert_eq!(stream.check_alive(), 1);

        writer.close();
        assert_eq!(stream.check_alive(), 0);
        assert_eq!(stream.writer_count(), 0);
    }

    #[tokio::test]
    async fn trans_stop_evicts_publisher() {
        let stream = Stream::new(info("live/a", ""), 1);
        let (handle, reader) =
            StreamReader::channel(info("live/a", "pub1"), Duration::from_secs(10));
        stream.attach_reader(reader, None);

        handle.send(keyframe(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(stream.is_start());

        stream.trans_stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_evicted());
        assert!(!stream.is_start());
    }
}
