//! Audio timestamp alignment
//!
//! FLV timestamps are whole milliseconds, but AAC frames land every
//! 1024/sampleRate seconds (21.33 ms at 48 kHz). Rounded timestamps drift
//! off the frame grid and produce audible clicks after TS muxing. The
//! aligner snaps each DTS to the predicted grid position while the error
//! stays within 2 ms, and rebases the grid when it does not.

use crate::ts::muxer::TICKS_PER_MS;

/// Tolerated distance from the predicted grid slot, in milliseconds
const SYNC_MS: u64 = 2;

#[derive(Debug, Default)]
pub struct TimestampAligner {
    frame_num: u64,
    frame_base: u64,
}

impl TimestampAligner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snap `dts` (90 kHz ticks) onto the frame grid. `inc` is the grid
    /// step: `90000 * samples_per_frame / sample_rate`.
    pub fn align(&mut self, dts: &mut u64, inc: u32) {
        let actual = *dts;
        let predicted = self.frame_base + self.frame_num * u64::from(inc);

        let delta = predicted.abs_diff(actual);
        if delta <= SYNC_MS * TICKS_PER_MS as u64 {
            self.frame_num += 1;
            *dts = predicted;
            return;
        }

        // Off the grid: rebase. frame_num restarts at 1, not 0, so the
        // next frame predicts one step past the new base.
        self.frame_num = 1;
        self.frame_base = actual;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 48 kHz AAC: 1024 samples -> 1920 ticks per frame
    const INC_48K: u32 = 90000 * 1024 / 48000;

    #[test]
    fn snaps_rounded_timestamps_to_grid() {
        let mut aligner = TimestampAligner::new();

        // Millisecond-rounded FLV timestamps for a 48 kHz stream.
        let input_ms = [0u64, 21, 43, 64, 86];
        let mut aligned = Vec::new();
        for ms in input_ms {
            let mut dts = ms * TICKS_PER_MS as u64;
            aligner.align(&mut dts, INC_48K);
            aligned.push(dts);
        }

        // First frame rebases; the rest land exactly on the grid.
        for (i, &dts) in aligned.iter().enumerate() {
            assert_eq!(dts, i as u64 * u64::from(INC_48K), "frame {i}");
        }
    }

    #[test]
    fn rebase_on_large_gap() {
        let mut aligner = TimestampAligner::new();

        let mut dts = 0u64;
        aligner.align(&mut dts, INC_48K);

        // Discontinuity far beyond tolerance.
        let mut dts = 500 * TICKS_PER_MS as u64;
        aligner.align(&mut dts, INC_48K);
        assert_eq!(dts, 500 * TICKS_PER_MS as u64);

        // Grid continues from the new base.
        let mut dts = 521 * TICKS_PER_MS as u64;
        aligner.align(&mut dts, INC_48K);
        assert_eq!(dts, 500 * TICKS_PER_MS as u64 + u64::from(INC_48K));
    }

    #[test]
    fn tolerance_boundary() {
        let mut aligner = TimestampAligner::new();
        let mut dts = 0u64;
        aligner.align(&mut dts, INC_48K);

        // Exactly 2 ms off the predicted slot still snaps.
        let predicted = u64::from(INC_48K);
        let mut dts = predicted + 2 * TICKS_PER_MS as u64;
        aligner.align(&mut dts, INC_48K);
        assert_eq!(dts, predicted);

        // Just past 2 ms rebases.
        let predicted = 2 * u64::from(INC_48K);
        let off = predicted + 2 * TICKS_PER_MS as u64 + 1;
        let mut dts = off;
        aligner.align(&mut dts, INC_48K);
        assert_eq!(dts, off);
    }
}
