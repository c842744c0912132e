//! Loss detection for publication images.
//!
//! Each work iteration runs the gap scanner over
//! `[rebuild_position, hwm)`. A gap that persists beyond the feedback
//! delay produces a NAK; an unanswered NAK is retried with exponential
//! backoff and deterministic jitter. NAK generation is suppressed entirely
//! while an image is draining (the caller simply stops scanning).

use spate_logbuffer::gap_scanner::Gap;
use spate_primitives::region::Region;

/// Delay policy before the first NAK and between retries.
pub enum FeedbackDelayGenerator {
    /// Fixed initial delay (unicast). Zero means NAK immediately.
    Static { delay_ns: i64 },
    /// Group-size-derived randomised delay (multicast) so a crowd of
    /// receivers does not NAK in unison.
    Multicast {
        max_backoff_ns: i64,
        group_size: usize,
        /// xorshift state; seeded per image so the jitter is deterministic
        /// for a receiver but uncorrelated across them.
        seed: u64,
    },
}

impl FeedbackDelayGenerator {
    fn next_delay_ns(&mut self) -> i64 {
        match self {
            FeedbackDelayGenerator::Static { delay_ns } => *delay_ns,
            FeedbackDelayGenerator::Multicast { max_backoff_ns, group_size, seed } => {
                // xorshift64*
                *seed ^= *seed >> 12;
                *seed ^= *seed << 25;
                *seed ^= *seed >> 27;
                let uniform =
                    (seed.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11) as f64 / (1u64 << 53) as f64;
                let spread = (*max_backoff_ns as f64) / (*group_size).max(1) as f64;
                (uniform * spread) as i64
            }
        }
    }
}

enum State {
    Idle,
    /// A gap is being timed; NAK when the deadline passes.
    Armed { gap: Gap, deadline_ns: i64, backoff_ns: i64 },
}

/// Per-image loss detector.
pub struct LossDetector {
    delay_generator: FeedbackDelayGenerator,
    max_backoff_ns: i64,
    state: State,
}

impl LossDetector {
    pub fn new(delay_generator: FeedbackDelayGenerator, max_backoff_ns: i64) -> Self {
        Self { delay_generator, max_backoff_ns, state: State::Idle }
    }

    /// Scan for loss; `on_gap` fires when a NAK is due.
    ///
    /// Returns 1 when a NAK was emitted, else 0.
    pub fn scan(
        &mut self,
        term: Region,
        term_id: i32,
        rebuild_offset: usize,
        limit_offset: usize,
        now_ns: i64,
        mut on_gap: impl FnMut(&Gap),
    ) -> usize {
        let current =
            spate_logbuffer::gap_scanner::scan_for_gap(term, term_id, rebuild_offset, limit_offset);

        let Some(gap) = current else {
            self.state = State::Idle;
            return 0;
        };

        match &mut self.state {
            State::Armed { gap: armed, deadline_ns, backoff_ns }
                if armed.term_id == gap.term_id && armed.term_offset == gap.term_offset =>
            {
                // Same gap still open; the length may have grown.
                armed.length = gap.length;
                if now_ns >= *deadline_ns {
                    on_gap(armed);
                    // Exponential backoff for the retry, capped.
                    *backoff_ns = (*backoff_ns * 2).clamp(1, self.max_backoff_ns.max(1));
                    *deadline_ns = now_ns + *backoff_ns;
                    return 1;
                }
                0
            }
            _ => {
                // New gap (or rebuild progressed past the armed one).
                let delay = self.delay_generator.next_delay_ns();
                if delay == 0 {
                    on_gap(&gap);
                    self.state = State::Armed {
                        gap,
                        deadline_ns: now_ns + self.max_backoff_ns.max(1),
                        backoff_ns: self.max_backoff_ns.max(1),
                    };
                    return 1;
                }
                self.state = State::Armed { gap, deadline_ns: now_ns + delay, backoff_ns: delay };
                0
            }
        }
    }

    /// The currently-armed gap, if any.
    pub fn armed_gap(&self) -> Option<Gap> {
        match &self.state {
            State::Armed { gap, .. } => Some(*gap),
            State::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spate_logbuffer::layout::LogBuffers;
    use spate_logbuffer::rebuilder;
    use spate_proto::{frame_type, DataHeader, DATA_HEADER_LENGTH, UNFRAGMENTED};

    fn frame(term_offset: i32, payload_len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; DATA_HEADER_LENGTH + payload_len];
        DataHeader {
            frame_length: (DATA_HEADER_LENGTH + payload_len) as i32,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset,
            session_id: 1,
            stream_id: 1,
            term_id: 0,
            reserved_value: 0,
        }
        .encode(&mut buf);
        buf
    }

    fn detector(delay_ns: i64) -> LossDetector {
        LossDetector::new(FeedbackDelayGenerator::Static { delay_ns }, 1_000_000)
    }

    #[test]
    fn gap_naks_after_delay() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 128, &frame(128, 32));

        let mut detector = detector(100);
        let mut naks = Vec::new();

        // First sighting arms the timer, no NAK yet.
        assert_eq!(detector.scan(term, 0, 0, 192, 1000, |g| naks.push(*g)), 0);
        assert!(naks.is_empty());

        // Deadline passes, the NAK fires for the whole gap.
        assert_eq!(detector.scan(term, 0, 0, 192, 1100, |g| naks.push(*g)), 1);
        assert_eq!(naks.len(), 1);
        assert_eq!(naks[0].term_offset, 0);
        assert_eq!(naks[0].length, 128);
    }

    #[test]
    fn repaired_gap_disarms() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 128, &frame(128, 32));

        let mut detector = detector(100);
        detector.scan(term, 0, 0, 192, 0, |_| {});
        assert!(detector.armed_gap().is_some());

        rebuilder::insert(term, 0, &frame(0, 96));
        detector.scan(term, 0, 0, 192, 50, |_| panic!("no gap left"));
        assert!(detector.armed_gap().is_none());
    }

    #[test]
    fn unanswered_nak_retries_with_backoff() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 128, &frame(128, 32));

        let mut detector = detector(0); // immediate NAK policy
        let mut nak_times = Vec::new();

        let mut now = 0i64;
        for _ in 0..100 {
            if detector.scan(term, 0, 0, 192, now, |_| nak_times.push(now)) > 0 {}
            now += 500_000;
        }
        assert!(nak_times.len() >= 2, "NAK must be retried");
        assert!(nak_times.len() < 100, "retries must back off");
    }

    #[test]
    fn multicast_delay_is_bounded() {
        let mut generator = FeedbackDelayGenerator::Multicast {
            max_backoff_ns: 10_000_000,
            group_size: 10,
            seed: 0x853c_49e6_748f_ea9b,
        };
        for _ in 0..1000 {
            let delay = generator.next_delay_ns();
            assert!(delay >= 0);
            assert!(delay <= 1_000_000);
        }
    }
}
