//! HLS source: per-stream FLV -> TS pipeline
//!
//! Each published stream gets one source, attached to the hub as an
//! internal writer. A dedicated worker drains the subscriber queue and
//! drives the transform chain:
//!
//! ```text
//! packet -> tag demux -> AVCC->Annex-B / AAC->ADTS -> align -> TS mux
//!                                   |
//!                       cut on keyframe >= 3 s  -> segment cache -> M3U8
//! ```
//!
//! Sequence headers configure the parsers and are not emitted as media.
//! Segments open with PAT + PMT; video keyframes carry the PCR. The
//! remainder is flushed as a final segment when the publisher stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::RwLock;

use crate::error::MediaError;
use crate::hls::align::TimestampAligner;
use crate::hls::audio_cache::{AudioCache, BATCH_FRAMES};
use crate::hls::cache::{SegmentCache, TsItem};
use crate::hub::entry::StreamWriter;
use crate::hub::packet::{Packet, PacketHeader, PacketKind, StreamInfo};
use crate::media::aac::{AdtsWriter, SAMPLES_PER_FRAME};
use crate::media::flv::{self, SOUND_AAC};
use crate::media::h264::AnnexBConverter;
use crate::ts::muxer::{TsMuxer, TICKS_PER_MS};

/// A segment closes at the first keyframe after this much accumulated time
pub const SEGMENT_DURATION_MS: i64 = 3000;

/// Per-stream HLS endpoint: hub writer plus the segment window
pub struct HlsSource {
    pub info: StreamInfo,
    writer: Arc<StreamWriter>,
    cache: Arc<RwLock<SegmentCache>>,
    closed: Arc<AtomicBool>,
}

impl HlsSource {
    /// Create a source for `key` and start its worker. The returned
    /// source's `writer()` must be attached to the hub.
    pub fn spawn(key: &str, timeout: Duration) -> Arc<HlsSource> {
        let info = StreamInfo::new(key, "", nanoid::nanoid!(12)).internal();
        let writer = StreamWriter::new(info.clone(), timeout);
        let cache = Arc::new(RwLock::new(SegmentCache::new(key)));
        let closed = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            key: key.to_string(),
            writer: writer.clone(),
            cache: cache.clone(),
            closed: closed.clone(),
            video: AnnexBConverter::new(),
            audio: AdtsWriter::new(),
            muxer: TsMuxer::new(),
            aligner: TimestampAligner::new(),
            batch: AudioCache::new(),
            clock: SegmentClock::default(),
            segment: BytesMut::new(),
            opened: false,
            seq: 0,
        };
        tokio::spawn(worker.run());

        Arc::new(HlsSource {
            info,
            writer,
            cache,
            closed,
        })
    }

    /// Hub endpoint feeding this source
    pub fn writer(&self) -> Arc<StreamWriter> {
        self.writer.clone()
    }

    pub async fn playlist(&self) -> String {
        self.cache.read().await.playlist()
    }

    pub async fn segment(&self, name: &str) -> Option<TsItem> {
        self.cache.read().await.get_item(name).cloned()
    }

    pub async fn segment_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Ingest has stopped; the cache still serves in-flight reads
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn alive(&self) -> bool {
        !self.is_closed() && self.writer.liveness.alive()
    }
}

/// Segment wall-clock in stream time: first/last media timestamp seen
#[derive(Debug, Default)]
struct SegmentClock {
    first_set: bool,
    first_ts: i64,
    last_ts: i64,
}

impl SegmentClock {
    fn update(&mut self, ts_ms: u32) {
        if !self.first_set {
            self.first_set = true;
            self.first_ts = i64::from(ts_ms);
        }
        self.last_ts = i64::from(ts_ms);
    }

    fn duration_ms(&self) -> i64 {
        self.last_ts - self.first_ts
    }

    fn reset(&mut self) {
        self.first_set = false;
        self.first_ts = 0;
        self.last_ts = 0;
    }
}

struct Worker {
    key: String,
    writer: Arc<StreamWriter>,
    cache: Arc<RwLock<SegmentCache>>,
    closed: Arc<AtomicBool>,

    video: AnnexBConverter,
    audio: AdtsWriter,
    muxer: TsMuxer,
    aligner: TimestampAligner,
    batch: AudioCache,
    clock: SegmentClock,

    /// TS bytes of the segment being built
    segment: BytesMut,
    /// A segment is open (first keyframe seen)
    opened: bool,
    seq: i64,
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!(stream = %self.key, "hls source started");

        while let Some(packet) = self.writer.recv().await {
            self.writer.liveness.touch();

            if packet.is_metadata() {
                continue;
            }

            let result = match packet.kind {
                PacketKind::Video => self.on_video(&packet).await,
                PacketKind::Audio => self.on_audio(&packet),
                PacketKind::Metadata => Ok(()),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_codec_rejection() => {
                    tracing::error!(stream = %self.key, error = %e, "hls source rejecting stream");
                    break;
                }
                Err(e) => {
                    tracing::warn!(stream = %self.key, error = %e, "hls parse error, packet skipped");
                }
            }
        }

        self.finish().await;
        self.closed.store(true, Ordering::Release);
        tracing::debug!(stream = %self.key, "hls source stopped");
    }

    async fn on_video(&mut self, packet: &Packet) -> Result<(), MediaError> {
        let header = match packet.video_header() {
            Some(h) => *h,
            None => return Err(MediaError::InvalidVideoTag),
        };

        // End-of-sequence marker is a benign no-op.
        if flv::is_avc_end_of_seq(&packet.data) || header.is_end_of_seq() {
            return Ok(());
        }
        if !header.is_h264() {
            return Err(MediaError::UnsupportedVideoCodec(header.codec_id));
        }

        let body = packet.data.slice(5..);

        if header.is_seq_header() {
            let config = self.video.set_config(body)?;
            tracing::info!(
                stream = %self.key,
                profile = config.profile_name(),
                level = %config.level_string(),
                "video configured"
            );
            return Ok(());
        }

        let mut annexb = BytesMut::with_capacity(body.len() + 64);
        self.video.convert(&body, &mut annexb)?;

        if header.is_key_frame() {
            self.cut().await;
        }
        if !self.opened {
            return Ok(());
        }

        self.clock.update(packet.timestamp);
        let out = Packet {
            kind: PacketKind::Video,
            timestamp: packet.timestamp,
            stream_id: packet.stream_id,
            header: PacketHeader::Video(header),
            data: annexb.freeze(),
        };
        self.muxer.mux(&out, &mut self.segment);
        Ok(())
    }

    fn on_audio(&mut self, packet: &Packet) -> Result<(), MediaError> {
        let header = match packet.audio_header() {
            Some(h) => *h,
            None => return Err(MediaError::InvalidAudioTag),
        };
        if header.sound_format != SOUND_AAC {
            return Err(MediaError::UnsupportedAudioFormat(header.sound_format));
        }

        let body = packet.data.slice(2..);

        if header.is_seq_header() {
            let config = self.audio.set_config(body)?;
            tracing::info!(
                stream = %self.key,
                sample_rate = config.sample_rate,
                channels = config.channels,
                "audio configured"
            );
            return Ok(());
        }

        // Nothing is muxed until the first video keyframe opens a segment.
        if !self.opened {
            return Ok(());
        }

        let mut adts = BytesMut::with_capacity(body.len() + 7);
        self.audio.write_frame(&body, &mut adts)?;

        self.clock.update(packet.timestamp);

        let mut dts = u64::from(packet.timestamp) * TICKS_PER_MS as u64;
        let inc = 90_000 * SAMPLES_PER_FRAME / self.audio.sample_rate();
        self.aligner.align(&mut dts, inc);

        self.batch.cache(&adts, dts);
        if self.batch.frame_count() >= BATCH_FRAMES {
            self.mux_audio(BATCH_FRAMES);
        }
        Ok(())
    }

    /// Mux the audio batch as one PES once it holds `min_frames`
    fn mux_audio(&mut self, min_frames: u8) {
        if self.batch.frame_count() < min_frames {
            return;
        }
        let (pts, data) = self.batch.take();
        let packet = Packet {
            kind: PacketKind::Audio,
            timestamp: (pts / TICKS_PER_MS as u64) as u32,
            stream_id: 0,
            header: PacketHeader::None,
            data,
        };
        self.muxer.mux(&packet, &mut self.segment);
    }

    /// Open the first segment, or close the current one once it has
    /// accumulated enough duration. Every fresh segment starts with
    /// PAT + PMT.
    async fn cut(&mut self) {
        let mut fresh = false;

        if !self.opened {
            self.opened = true;
            fresh = true;
        } else if self.clock.duration_ms() >= SEGMENT_DURATION_MS {
            self.emit_segment().await;
            fresh = true;
        }

        if fresh {
            let pat = self.muxer.pat();
            self.segment.put_slice(&pat);
            let pmt = self.muxer.pmt(SOUND_AAC, true);
            self.segment.put_slice(&pmt);
        }
    }

    /// Close the segment under construction into the cache
    async fn emit_segment(&mut self) {
        self.mux_audio(1);
        self.seq += 1;

        // Wall-clock name with the sequence number appended, so two cuts
        // in the same second cannot shadow each other in the cache.
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let item = TsItem {
            name: format!("/{}/{}_{}.ts", self.key, unix, self.seq),
            seq_num: self.seq,
            duration_ms: self.clock.duration_ms(),
            data: self.segment.split().freeze(),
        };

        tracing::debug!(
            stream = %self.key,
            seq = item.seq_num,
            duration_ms = item.duration_ms,
            bytes = item.data.len(),
            "segment closed"
        );
        self.cache.write().await.set_item(item);
        self.clock.reset();
    }

    /// Publisher stopped: flush whatever the open segment holds
    async fn finish(&mut self) {
        if self.opened && self.clock.first_set && self.clock.duration_ms() > 0 {
            self.emit_segment().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::packet::test_support::*;
    use crate::ts::muxer::TS_PACKET_LEN;

    async fn feed(source: &Arc<HlsSource>, packets: Vec<Packet>) {
        let writer = source.writer();
        for p in packets {
            writer.write(&p).unwrap();
            // Let the worker keep pace with the feed.
            tokio::task::yield_now().await;
        }
    }

    async fn close_and_wait(source: &Arc<HlsSource>) {
        source.writer().close();
        for _ in 0..100 {
            if source.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hls worker did not stop");
    }

    /// Keyframes every `gop_ms`, inter frames every 40 ms, audio every
    /// 23 ms, interleaved in timestamp order, for `total_ms` of stream
    /// time.
    fn synthetic_stream(total_ms: u32, gop_ms: u32) -> Vec<Packet> {
        let mut packets = vec![video_seq_header(0), audio_seq_header(0)];
        let (mut vts, mut ats) = (0u32, 0u32);
        while vts < total_ms || ats < total_ms {
            if vts < total_ms && (ats >= total_ms || vts <= ats) {
                if vts % gop_ms == 0 {
                    packets.push(keyframe(vts));
                } else {
                    packets.push(inter_frame(vts));
                }
                vts += 40;
            } else {
                packets.push(audio_frame(ats));
                ats += 23;
            }
        }
        packets
    }

    #[tokio::test]
    async fn segments_cut_and_playlist_bounded() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        feed(&source, synthetic_stream(10_000, 3200)).await;
        close_and_wait(&source).await;

        let count = source.segment_count().await;
        assert!(count >= 1 && count <= 3, "window holds 1..=3, got {count}");

        let playlist = source.playlist().await;
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:"));
        assert!(playlist.matches("#EXTINF:").count() == count);
    }

    #[tokio::test]
    async fn segment_bodies_are_ts_aligned() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        feed(&source, synthetic_stream(8_000, 3200)).await;
        close_and_wait(&source).await;

        let playlist = source.playlist().await;
        let names: Vec<&str> = playlist
            .lines()
            .filter(|l| l.ends_with(".ts"))
            .collect();
        assert!(!names.is_empty());

        for name in names {
            let item = source.segment(name).await.expect("segment by name");
            assert!(!item.data.is_empty());
            assert_eq!(item.data.len() % TS_PACKET_LEN, 0);
            assert_eq!(item.data[0], 0x47);
            // Fresh segment leads with PAT then PMT.
            assert_eq!(item.data[1] & 0x1F, 0x00);
            assert_eq!(item.data[2], 0x00);
            assert_eq!(item.data[TS_PACKET_LEN + 1] & 0x1F, 0x10);
        }
    }

    #[tokio::test]
    async fn cut_points_follow_keyframes() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));

        // Keyframes at 0, 3200, 6100 with inter frames between, stream
        // ends shortly after 6100.
        let mut packets = vec![video_seq_header(0), audio_seq_header(0), keyframe(0)];
        for ts in (40..3200).step_by(40) {
            packets.push(inter_frame(ts));
        }
        packets.push(keyframe(3200));
        for ts in (3240..6100).step_by(40) {
            packets.push(inter_frame(ts));
        }
        packets.push(keyframe(6100));
        for ts in (6140..6400).step_by(40) {
            packets.push(inter_frame(ts));
        }

        feed(&source, packets).await;
        close_and_wait(&source).await;

        let playlist = source.playlist().await;
        // First segment ended at the 3200 keyframe (duration ~3.2 s), the
        // tail was flushed on close; longest segment rounds into
        // TARGETDURATION 4.
        assert!(playlist.contains("#EXT-X-TARGETDURATION:4\n"));
        assert_eq!(source.segment_count().await, 2);

        let durations: Vec<f64> = playlist
            .lines()
            .filter_map(|l| l.strip_prefix("#EXTINF:"))
            .filter_map(|l| l.trim_end_matches(',').parse().ok())
            .collect();
        assert!((durations[0] - 3.2).abs() < 0.1, "got {durations:?}");
        assert!((durations[1] - 2.9).abs() < 0.35, "got {durations:?}");
    }

    #[tokio::test]
    async fn metadata_is_ignored() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        let mut packets = vec![metadata()];
        packets.extend(synthetic_stream(4000, 2000));
        feed(&source, packets).await;
        close_and_wait(&source).await;
        assert!(source.segment_count().await >= 1);
    }

    #[tokio::test]
    async fn end_of_seq_is_benign() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        let eos = Packet::video(
            100,
            1,
            Bytes::from_static(&[0x17, 0x02, 0x00, 0x00, 0x00]),
        )
        .unwrap();
        let mut packets = synthetic_stream(4000, 2000);
        packets.push(eos);
        feed(&source, packets).await;
        close_and_wait(&source).await;
        assert!(source.segment_count().await >= 1);
    }

    #[tokio::test]
    async fn non_h264_video_stops_source() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        // Codec id 2 (H.263)
        let bad = Packet::video(0, 1, Bytes::from_static(&[0x12, 0x01, 0x00, 0x00, 0x00]))
            .unwrap();
        source.writer().write(&bad).unwrap();

        for _ in 0..100 {
            if source.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn non_aac_audio_stops_source() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        // MP3 audio frame
        let bad = Packet::audio(0, 1, Bytes::from_static(&[0x2F, 0xFF, 0xFB])).unwrap();
        source.writer().write(&bad).unwrap();

        for _ in 0..100 {
            if source.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn no_media_before_first_keyframe() {
        let source = HlsSource::spawn("live/demo", Duration::from_secs(10));
        let packets = vec![
            video_seq_header(0),
            audio_seq_header(0),
            inter_frame(10),
            audio_frame(20),
        ];
        feed(&source, packets).await;
        close_and_wait(&source).await;
        assert_eq!(source.segment_count().await, 0);
    }
}
