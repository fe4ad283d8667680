//! Per-stream packet cache for subscriber priming
//!
//! A late joiner cannot decode from an arbitrary inter frame. The cache
//! retains the last metadata packet, both sequence headers, and a bounded
//! window of GOPs so a new subscriber starts with a decodable prefix:
//! metadata, video config, audio config, then every frame since the
//! retained keyframe.

use crate::hub::packet::Packet;

/// Stream packet cache with bounded GOP retention
#[derive(Debug)]
pub struct GopCache {
    video_seq_header: Option<Packet>,
    audio_seq_header: Option<Packet>,
    metadata: Option<Packet>,
    gop: Vec<Packet>,
    gop_count: usize,
    /// Number of GOPs retained before the window resets
    gop_num: usize,
}

impl GopCache {
    pub fn new(gop_num: usize) -> Self {
        Self {
            video_seq_header: None,
            audio_seq_header: None,
            metadata: None,
            gop: Vec::new(),
            gop_count: 0,
            gop_num: gop_num.max(1),
        }
    }

    /// Observe a packet from the publisher
    pub fn write(&mut self, packet: &Packet) {
        if packet.is_metadata() {
            self.metadata = Some(packet.clone());
            return;
        }

        if packet.is_video_seq_header() {
            self.video_seq_header = Some(packet.clone());
            return;
        }
        if packet.is_audio_seq_header() {
            self.audio_seq_header = Some(packet.clone());
            return;
        }

        if packet.is_key_frame() {
            if self.gop_count == self.gop_num {
                self.gop.clear();
            } else {
                self.gop_count += 1;
            }
            self.gop.push(packet.clone());
        } else if self.gop_count > 0 {
            // Media before the first keyframe is undecodable; skip it.
            self.gop.push(packet.clone());
        }
    }

    /// Packets a fresh subscriber must see before live traffic, in order
    pub fn priming_packets(&self) -> impl Iterator<Item = &Packet> {
        self.metadata
            .iter()
            .chain(self.video_seq_header.iter())
            .chain(self.audio_seq_header.iter())
            .chain(self.gop.iter())
    }

    pub fn gop_len(&self) -> usize {
        self.gop.len()
    }

    pub fn has_config(&self) -> bool {
        self.video_seq_header.is_some() || self.audio_seq_header.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::packet::test_support::*;

    #[test]
    fn priming_order() {
        let mut cache = GopCache::new(1);
        cache.write(&metadata());
        cache.write(&video_seq_header(0));
        cache.write(&audio_seq_header(0));
        cache.write(&keyframe(10));
        cache.write(&inter_frame(20));
        cache.write(&audio_frame(25));

        let primed: Vec<_> = cache.priming_packets().collect();
        assert!(primed[0].is_metadata());
        assert!(primed[1].is_video_seq_header());
        assert!(primed[2].is_audio_seq_header());
        assert!(primed[3].is_key_frame());
        assert_eq!(primed[4].timestamp, 20);
        assert_eq!(primed[5].timestamp, 25);
        assert_eq!(primed.len(), 6);
    }

    #[test]
    fn window_resets_on_keyframe_past_retention() {
        let mut cache = GopCache::new(1);
        cache.write(&keyframe(0));
        cache.write(&inter_frame(10));
        cache.write(&inter_frame(20));
        assert_eq!(cache.gop_len(), 3);

        // Retention exhausted: the next keyframe starts the window over.
        cache.write(&keyframe(1000));
        assert_eq!(cache.gop_len(), 1);
        let primed: Vec<_> = cache.priming_packets().collect();
        assert_eq!(primed.len(), 1);
        assert_eq!(primed[0].timestamp, 1000);
    }

    #[test]
    fn retains_configured_gop_count() {
        let mut cache = GopCache::new(2);
        cache.write(&keyframe(0));
        cache.write(&inter_frame(10));
        cache.write(&keyframe(1000));
        cache.write(&inter_frame(1010));
        assert_eq!(cache.gop_len(), 4);

        // Third keyframe exceeds retention of two.
        cache.write(&keyframe(2000));
        assert_eq!(cache.gop_len(), 1);
    }

    #[test]
    fn media_before_first_keyframe_skipped() {
        let mut cache = GopCache::new(1);
        cache.write(&inter_frame(5));
        cache.write(&audio_frame(6));
        assert_eq!(cache.gop_len(), 0);

        cache.write(&keyframe(10));
        cache.write(&audio_frame(11));
        assert_eq!(cache.gop_len(), 2);
    }

    #[test]
    fn seq_headers_replace_not_append() {
        let mut cache = GopCache::new(1);
        cache.write(&video_seq_header(0));
        cache.write(&video_seq_header(100));
        cache.write(&audio_seq_header(0));

        let primed: Vec<_> = cache.priming_packets().collect();
        assert_eq!(primed.len(), 2);
        assert_eq!(primed[0].timestamp, 100);
        assert!(cache.has_config());
    }

    #[test]
    fn zero_gop_num_clamped() {
        let mut cache = GopCache::new(0);
        cache.write(&keyframe(0));
        cache.write(&keyframe(10));
        assert_eq!(cache.gop_len(), 1);
    }
}
