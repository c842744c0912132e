//! Term gap scanner.
//!
//! Finds the first run of uncommitted bytes between the rebuild position
//! and the high-water mark. The result feeds the loss detector, which turns
//! persistent gaps into NAK frames.

use spate_primitives::region::Region;
use spate_proto::FRAME_ALIGNMENT;

use crate::layout::{align_frame_length, frame_length_volatile};

/// A missing range within one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

/// Scan `[rebuild_offset, limit_offset)` for the first gap.
///
/// Offsets are frame-aligned so the scan steps by [`FRAME_ALIGNMENT`]
/// inside a gap. `limit_offset` is the high-water mark clamped into this
/// term.
pub fn scan_for_gap(
    term: Region,
    term_id: i32,
    rebuild_offset: usize,
    limit_offset: usize,
) -> Option<Gap> {
    let limit = limit_offset.min(term.len());
    let mut offset = rebuild_offset;

    while offset < limit {
        let frame_length = frame_length_volatile(term, offset);
        if frame_length > 0 {
            offset += align_frame_length(frame_length as usize);
            continue;
        }

        let gap_start = offset;
        let mut gap_end = gap_start + FRAME_ALIGNMENT;
        while gap_end < limit && frame_length_volatile(term, gap_end) == 0 {
            gap_end += FRAME_ALIGNMENT;
        }

        return Some(Gap {
            term_id,
            term_offset: gap_start as i32,
            length: (gap_end.min(limit) - gap_start) as i32,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LogBuffers;
    use crate::rebuilder;
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

    #[test]
    fn contiguous_term_has_no_gap() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 0, &frame(0, 32));
        rebuilder::insert(term, 64, &frame(64, 32));

        assert_eq!(scan_for_gap(term, 0, 0, 128), None);
    }

    #[test]
    fn gap_between_frames_is_located() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 0, &frame(0, 32)); // frame [0, 64)
        rebuilder::insert(term, 192, &frame(192, 32)); // frame [192, 256)

        let gap = scan_for_gap(term, 7, 0, 256).unwrap();
        assert_eq!(gap.term_id, 7);
        assert_eq!(gap.term_offset, 64);
        assert_eq!(gap.length, 128);
    }

    #[test]
    fn gap_running_to_the_limit() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 0, &frame(0, 32));

        let gap = scan_for_gap(term, 0, 0, 320).unwrap();
        assert_eq!(gap.term_offset, 64);
        assert_eq!(gap.length, 256);
    }

    #[test]
    fn scan_starts_at_rebuild_offset() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 128, &frame(128, 32));

        // Scanning from 128 sees no gap up to 192.
        assert_eq!(scan_for_gap(term, 0, 128, 192), None);
    }
}
