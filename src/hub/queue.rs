//! Bounded per-subscriber packet queue
//!
//! Every subscriber gets its own queue so one slow consumer cannot stall
//! the rest. When a queue saturates, a shedding pass drops what a decoder
//! can live without: inter frames and overflow audio go, sequence headers
//! and keyframes stay. The pass partitions the scanned window into keep and
//! drop lists and rewrites the queue once.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::HubError;
use crate::hub::packet::Packet;

/// Queue capacity in packets
pub const QUEUE_CAPACITY: usize = 512;
/// Shedding starts when free slots drop to this level
const SHED_HEADROOM: usize = 24;
/// At most this many queued packets are examined per shedding pass
const SHED_SCAN: usize = QUEUE_CAPACITY - 84;
/// Audio is preserved unless the queue is within this many slots of full
const AUDIO_RESERVE: usize = 2;

#[derive(Debug, Default)]
struct Inner {
    deque: VecDeque<Packet>,
    closed: bool,
}

/// Single-producer single-consumer bounded queue with media-aware shedding
#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a packet, shedding first when nearly full. Never blocks.
    /// Returns the number of packets dropped by the shedding pass.
    pub fn push(&self, packet: Packet) -> Result<usize, HubError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(HubError::QueueClosed);
        }

        let mut dropped = 0;
        if self.capacity.saturating_sub(inner.deque.len()) <= SHED_HEADROOM {
            dropped = self.shed(&mut inner);
        }

        inner.deque.push_back(packet);
        drop(inner);
        self.notify.notify_one();
        Ok(dropped)
    }

    /// Dequeue the next packet, waiting until one arrives. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Packet> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(packet) = inner.deque.pop_front() {
                    return Some(packet);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking dequeue
    pub fn try_pop(&self) -> Option<Packet> {
        self.inner.lock().unwrap().deque.pop_front()
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One shedding pass over the head of the queue. Keeps audio (until the
    /// queue is within `AUDIO_RESERVE` of capacity) and video packets that
    /// are sequence headers or keyframes; everything else in the scanned
    /// window is discarded.
    fn shed(&self, inner: &mut Inner) -> usize {
        let scan = inner.deque.len().min(SHED_SCAN);
        let mut keep: Vec<Packet> = Vec::with_capacity(scan);
        let mut dropped = 0;

        for _ in 0..scan {
            let packet = match inner.deque.pop_front() {
                Some(p) => p,
                None => break,
            };
            let retain = if packet.is_audio() {
                true
            } else if packet.is_video() {
                packet.is_seq_header() || packet.is_key_frame()
            } else {
                false
            };
            if retain {
                keep.push(packet);
            } else {
                dropped += 1;
            }
        }

        // Still close to full: give up audio continuity, oldest first, but
        // never configuration or keyframes.
        while keep.len() + inner.deque.len() > self.capacity - AUDIO_RESERVE {
            match keep.iter().position(Packet::is_audio) {
                Some(idx) => {
                    keep.remove(idx);
                    dropped += 1;
                }
                None => break,
            }
        }

        for packet in keep.into_iter().rev() {
            inner.deque.push_front(packet);
        }

        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::packet::test_support::*;

    #[test]
    fn push_pop_order() {
        let queue = PacketQueue::new();
        queue.push(audio_frame(1)).unwrap();
        queue.push(audio_frame(2)).unwrap();

        assert_eq!(queue.try_pop().unwrap().timestamp, 1);
        assert_eq!(queue.try_pop().unwrap().timestamp, 2);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = std::sync::Arc::new(PacketQueue::new());
        let q = queue.clone();
        let handle = tokio::spawn(async move { q.pop().await });

        tokio::task::yield_now().await;
        queue.push(audio_frame(7)).unwrap();

        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.timestamp, 7);
    }

    #[tokio::test]
    async fn close_wakes_consumer() {
        let queue = std::sync::Arc::new(PacketQueue::new());
        let q = queue.clone();
        let handle = tokio::spawn(async move { q.pop().await });

        tokio::task::yield_now().await;
        queue.close();
        assert!(handle.await.unwrap().is_none());
    }

    #[test]
    fn push_after_close_fails() {
        let queue = PacketQueue::new();
        queue.close();
        assert!(queue.push(audio_frame(0)).is_err());
    }

    #[tokio::test]
    async fn drains_after_close() {
        let queue = PacketQueue::new();
        queue.push(audio_frame(1)).unwrap();
        queue.close();
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[test]
    fn shed_preserves_headers_and_keyframes() {
        let queue = PacketQueue::new();

        // Seed with configuration, then flood with inter frames and audio.
        queue.push(video_seq_header(0)).unwrap();
        queue.push(audio_seq_header(0)).unwrap();
        queue.push(keyframe(10)).unwrap();
        for i in 0..(QUEUE_CAPACITY - SHED_HEADROOM) {
            queue.push(inter_frame(20 + i as u32)).unwrap();
        }
        queue.push(keyframe(9999)).unwrap();

        let mut kept = Vec::new();
        while let Some(p) = queue.try_pop() {
            kept.push(p);
        }

        // Every sequence header and keyframe survived.
        assert!(kept.iter().any(Packet::is_video_seq_header));
        assert!(kept.iter().any(Packet::is_audio_seq_header));
        let keyframes: Vec<_> = kept
            .iter()
            .filter(|p| p.is_key_frame() && !p.is_seq_header())
            .collect();
        assert_eq!(keyframes.len(), 2);
        // The flood of inter frames was thinned.
        assert!(kept.len() < QUEUE_CAPACITY - SHED_HEADROOM);
    }

    #[test]
    fn shed_keeps_audio_until_reserve() {
        let queue = PacketQueue::new();
        for i in 0..(QUEUE_CAPACITY - SHED_HEADROOM) {
            queue.push(audio_frame(i as u32)).unwrap();
        }
        let dropped = queue.push(audio_frame(9999)).unwrap();

        // Audio is preserved by the scan; only the reserve guard may drop
        // a handful.
        assert!(queue.len() >= QUEUE_CAPACITY - SHED_HEADROOM - AUDIO_RESERVE);
        assert!(dropped <= SHED_HEADROOM + AUDIO_RESERVE);
    }

    #[test]
    fn shed_reports_drop_count() {
        let queue = PacketQueue::new();
        queue.push(keyframe(0)).unwrap();
        let mut dropped = 0;
        for i in 0..QUEUE_CAPACITY {
            dropped += queue.push(inter_frame(i as u32)).unwrap();
        }
        assert!(dropped > 0);
        assert!(queue.len() < QUEUE_CAPACITY);
    }

    #[test]
    fn order_preserved_across_shed() {
        let queue = PacketQueue::new();
        queue.push(keyframe(1)).unwrap();
        for i in 0..(QUEUE_CAPACITY - SHED_HEADROOM) {
            queue.push(inter_frame(100 + i as u32)).unwrap();
        }
        queue.push(keyframe(5000)).unwrap();

        let mut last_key_ts = 0;
        while let Some(p) = queue.try_pop() {
            if p.is_key_frame() {
                assert!(p.timestamp > last_key_ts || last_key_ts == 0);
                last_key_ts = p.timestamp;
            }
        }
        assert_eq!(last_key_ts, 5000);
    }
}
