//! Gap filler for unrepairable loss.
//!
//! When a NAK has gone unanswered past the retransmit timeout on an
//! unreliable stream, the receiver gives up on the range and pads over it
//! so subscribers can advance past the hole.

use spate_primitives::region::Region;

use crate::gap_scanner::Gap;
use crate::layout::write_padding_frame;

/// Cover `gap` with a zero-body padding frame.
pub fn fill_gap(term: Region, session_id: i32, stream_id: i32, gap: &Gap) {
    write_padding_frame(
        term,
        session_id,
        stream_id,
        gap.term_id,
        gap.term_offset as usize,
        gap.length as usize,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap_scanner::scan_for_gap;
    use crate::layout::{frame_length_volatile, is_padding_frame, LogBuffers};
    use crate::rebuilder;
    use spate_proto::{frame_type, DataHeader, DATA_HEADER_LENGTH, UNFRAGMENTED};

    #[test]
    fn filled_gap_no_longer_scans() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);

        let mut buf = vec![0u8; DATA_HEADER_LENGTH + 32];
        DataHeader {
            frame_length: (DATA_HEADER_LENGTH + 32) as i32,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset: 192,
            session_id: 1,
            stream_id: 1,
            term_id: 0,
            reserved_value: 0,
        }
        .encode(&mut buf);
        rebuilder::insert(term, 192, &buf);

        let gap = scan_for_gap(term, 0, 0, 256).unwrap();
        assert_eq!(gap.term_offset, 0);
        assert_eq!(gap.length, 192);

        fill_gap(term, 1, 1, &gap);
        assert!(is_padding_frame(term, 0));
        assert_eq!(frame_length_volatile(term, 0), 192);
        assert_eq!(scan_for_gap(term, 0, 0, 256), None);
    }
}
