//! Sender-side term scanner.
//!
//! Walks committed frames from an offset and reports how many contiguous
//! bytes can go on the wire. Stops at the first uncommitted frame (zero
//! length), at the scan cap, or at a padding frame — a padding frame's
//! header is transmitted (so receivers learn the term is closed out) but
//! its body is skipped, reported separately as `padding`.

use spate_primitives::region::Region;
use spate_proto::DATA_HEADER_LENGTH;

use crate::layout::{align_frame_length, frame_length_volatile, is_padding_frame};

/// Result of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanOutcome {
    /// Contiguous committed bytes to transmit, starting at the scan offset.
    pub available: usize,
    /// Bytes to skip after `available` without transmitting (padding body).
    pub padding: usize,
}

impl ScanOutcome {
    /// Total advance of the sender position for this scan.
    #[inline]
    pub fn advance(&self) -> usize {
        self.available + self.padding
    }
}

/// Scan `term` from `offset` for up to `max_length` transmittable bytes.
pub fn scan_for_availability(term: Region, offset: usize, max_length: usize) -> ScanOutcome {
    let term_length = term.len();
    let mut outcome = ScanOutcome::default();

    while offset + outcome.available < term_length {
        let frame_offset = offset + outcome.available;
        let frame_length = frame_length_volatile(term, frame_offset);
        if frame_length <= 0 {
            break;
        }
        let aligned = align_frame_length(frame_length as usize);

        if is_padding_frame(term, frame_offset) {
            if outcome.available + DATA_HEADER_LENGTH > max_length {
                break;
            }
            outcome.available += DATA_HEADER_LENGTH;
            outcome.padding = aligned - DATA_HEADER_LENGTH;
            break;
        }

        if outcome.available + aligned > max_length {
            break;
        }
        outcome.available += aligned;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appender::TermAppender;
    use crate::layout::{write_padding_frame, LogBuffers};

    #[test]
    fn empty_term_yields_nothing() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        assert_eq!(scan_for_availability(log.term(0), 0, 4096), ScanOutcome::default());
    }

    #[test]
    fn stops_at_first_uncommitted_frame() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let appender = TermAppender::new(log.term(0), log.meta(), 0);
        appender.append_unfragmented(&[1u8; 64], 1376);

        // A later frame beyond a hole is invisible to the scanner.
        write_padding_frame(log.term(0), 1, 1, 0, 256, 128);
        let outcome = scan_for_availability(log.term(0), 0, 4096);
        assert_eq!(outcome.available, 96);
        assert_eq!(outcome.padding, 0);
    }

    #[test]
    fn cap_respects_frame_boundaries() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let appender = TermAppender::new(log.term(0), log.meta(), 0);
        for _ in 0..4 {
            appender.append_unfragmented(&[0u8; 96], 1376); // 128-byte frames
        }
        // Cap of 300 fits two 128-byte frames, not three.
        let outcome = scan_for_availability(log.term(0), 0, 300);
        assert_eq!(outcome.available, 256);
    }

    #[test]
    fn padding_header_is_sent_body_skipped() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let appender = TermAppender::new(log.term(0), log.meta(), 0);
        appender.append_unfragmented(&[0u8; 96], 1376);
        write_padding_frame(log.term(0), 1, 1, 0, 128, 1024);

        let outcome = scan_for_availability(log.term(0), 0, 8192);
        assert_eq!(outcome.available, 128 + DATA_HEADER_LENGTH);
        assert_eq!(outcome.padding, 1024 - DATA_HEADER_LENGTH);
        assert_eq!(outcome.advance(), 128 + 1024);
    }
}
