//! Receiver-side term rebuilder.
//!
//! Places an arriving packet's frames into the term at their stated offset.
//! The packet body is copied first; the **first** frame's length is stored
//! last with release. A packet may carry several frames (the sender
//! transmits scan ranges); interior lengths are plain copies, which is
//! sound because a subscriber must pass the first frame's acquire before it
//! can reach them.
//!
//! Duplicate delivery is idempotent: a frame whose length is already
//! committed is left untouched (retransmitted bytes are identical by
//! protocol).

use spate_primitives::region::Region;

use crate::layout::{frame_length_volatile, set_frame_length_ordered};

/// Insert `packet` (one or more complete frames) at `term_offset`.
pub fn insert(term: Region, term_offset: usize, packet: &[u8]) {
    if packet.len() < 4 || term_offset >= term.len() {
        return;
    }
    if frame_length_volatile(term, term_offset) != 0 {
        // Already rebuilt; duplicates carry identical bytes.
        return;
    }

    let first_frame_length =
        i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
    let copy_length = packet.len().min(term.len() - term_offset);

    term.put_bytes(term_offset + 4, &packet[4..copy_length]);
    set_frame_length_ordered(term, term_offset, first_frame_length);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LogBuffers;
    use spate_proto::{frame_type, DataHeader, DATA_HEADER_LENGTH, UNFRAGMENTED};

    fn packet(term_id: i32, term_offset: i32, payload: &[u8]) -> Vec<u8> {
        let frame_length = DATA_HEADER_LENGTH + payload.len();
        let mut buf = vec![0u8; frame_length];
        DataHeader {
            frame_length: frame_length as i32,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset,
            session_id: 1,
            stream_id: 2,
            term_id,
            reserved_value: 0,
        }
        .encode(&mut buf);
        buf[DATA_HEADER_LENGTH..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn inserted_frame_is_committed() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let term = log.term(0);

        let pkt = packet(0, 0, &[0xaa; 100]);
        insert(term, 0, &pkt);

        assert_eq!(frame_length_volatile(term, 0) as usize, DATA_HEADER_LENGTH + 100);
        let mut byte = [0u8; 1];
        term.get_bytes(DATA_HEADER_LENGTH + 99, &mut byte);
        assert_eq!(byte[0], 0xaa);
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let term = log.term(0);

        let pkt = packet(0, 64, &[0x11; 32]);
        insert(term, 64, &pkt);
        insert(term, 64, &pkt);
        insert(term, 64, &pkt);

        assert_eq!(frame_length_volatile(term, 64) as usize, DATA_HEADER_LENGTH + 32);
        let mut byte = [0u8; 1];
        term.get_bytes(64 + DATA_HEADER_LENGTH, &mut byte);
        assert_eq!(byte[0], 0x11);
    }

    #[test]
    fn out_of_order_arrival_leaves_gap_then_fills() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let term = log.term(0);

        insert(term, 128, &packet(0, 128, &[2u8; 32]));
        assert_eq!(frame_length_volatile(term, 0), 0);
        assert!(frame_length_volatile(term, 128) > 0);

        insert(term, 0, &packet(0, 0, &[1u8; 96]));
        assert!(frame_length_volatile(term, 0) > 0);
    }
}
