//! Publisher-side term appender.
//!
//! Claims space by `fetch_add` on the partition's raw tail, writes the
//! frame body, and publishes by releasing `frame_length`. A claim that runs
//! past the term end writes a padding frame over whatever usable space
//! remains and reports the trip so the caller can rotate the log.
//!
//! Many publishers may append to the same partition concurrently; the
//! `fetch_add` hands each a disjoint range.

use spate_primitives::region::Region;
use spate_primitives::sync::Ordering;
use spate_proto::{DataHeader, BEGIN_FLAG, DATA_HEADER_LENGTH, END_FLAG};

use crate::layout::{
    self, align_frame_length, set_frame_length_ordered, write_padding_frame, LogMetaData,
};

/// Result of an append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Frame(s) committed; the partition tail is now at this offset.
    Appended { new_tail_offset: i32 },
    /// The claim ran past the term end; the caller should rotate the log
    /// and retry on the next partition.
    Tripped,
    /// Payload larger than the appender accepts for this call.
    MaxMessageExceeded,
}

/// Appender over one term partition.
pub struct TermAppender<'a> {
    term: Region,
    meta: &'a LogMetaData,
    partition: usize,
}

impl<'a> TermAppender<'a> {
    pub fn new(term: Region, meta: &'a LogMetaData, partition: usize) -> Self {
        Self { term, meta, partition }
    }

    /// Claim `aligned` bytes; returns the raw tail before the add.
    fn claim(&self, aligned: usize) -> i64 {
        self.meta.tail_counters[self.partition].fetch_add(aligned as i64, Ordering::AcqRel)
    }

    fn template(&self) -> (i32, i32) {
        // The template always decodes: it was encoded at log initialisation.
        match DataHeader::decode(&self.meta.default_frame_header) {
            Ok(header) => (header.session_id, header.stream_id),
            Err(_) => (0, 0),
        }
    }

    fn handle_term_trip(&self, term_id: i32, offset: usize) {
        let term_length = self.term.len();
        if offset < term_length {
            let (session_id, stream_id) = self.template();
            write_padding_frame(
                self.term,
                session_id,
                stream_id,
                term_id,
                offset,
                term_length - offset,
            );
        }
    }

    fn write_frame(&self, term_id: i32, offset: usize, flags: u8, payload: &[u8]) {
        let frame_length = DATA_HEADER_LENGTH + payload.len();
        let mut header = self.meta.default_frame_header;
        header[5] = flags;
        header[8..12].copy_from_slice(&(offset as i32).to_le_bytes());
        header[20..24].copy_from_slice(&term_id.to_le_bytes());

        self.term.put_bytes(offset + 4, &header[4..]);
        self.term.put_bytes(offset + DATA_HEADER_LENGTH, payload);
        set_frame_length_ordered(self.term, offset, frame_length as i32);
    }

    /// Append a message that fits a single frame.
    ///
    /// `max_payload` is the MTU minus the data header.
    pub fn append_unfragmented(&self, payload: &[u8], max_payload: usize) -> AppendOutcome {
        if payload.len() > max_payload {
            return AppendOutcome::MaxMessageExceeded;
        }

        let aligned = align_frame_length(DATA_HEADER_LENGTH + payload.len());
        let raw_tail = self.claim(aligned);
        let term_id = layout::term_id(raw_tail);
        let offset = (raw_tail & 0xFFFF_FFFF) as usize;

        if offset + aligned > self.term.len() {
            self.handle_term_trip(term_id, offset.min(self.term.len()));
            return AppendOutcome::Tripped;
        }

        self.write_frame(term_id, offset, spate_proto::UNFRAGMENTED, payload);
        AppendOutcome::Appended { new_tail_offset: (offset + aligned) as i32 }
    }

    /// Append a message split across MTU-sized fragments.
    ///
    /// All fragments are claimed at once so they are contiguous; each
    /// fragment is committed in order, BEGIN on the first, END on the last.
    pub fn append_fragmented(
        &self,
        payload: &[u8],
        max_payload: usize,
        max_message: usize,
    ) -> AppendOutcome {
        if payload.len() <= max_payload {
            return self.append_unfragmented(payload, max_payload);
        }
        if payload.len() > max_message {
            return AppendOutcome::MaxMessageExceeded;
        }

        let fragments = payload.len().div_ceil(max_payload);
        let last_fragment_length = payload.len() - (fragments - 1) * max_payload;
        let required = (fragments - 1) * align_frame_length(DATA_HEADER_LENGTH + max_payload)
            + align_frame_length(DATA_HEADER_LENGTH + last_fragment_length);

        let raw_tail = self.claim(required);
        let term_id = layout::term_id(raw_tail);
        let offset = (raw_tail & 0xFFFF_FFFF) as usize;

        if offset + required > self.term.len() {
            self.handle_term_trip(term_id, offset.min(self.term.len()));
            return AppendOutcome::Tripped;
        }

        let mut frame_offset = offset;
        let mut remaining = payload;
        for fragment in 0..fragments {
            let length = remaining.len().min(max_payload);
            let mut flags = 0u8;
            if fragment == 0 {
                flags |= BEGIN_FLAG;
            }
            if fragment == fragments - 1 {
                flags |= END_FLAG;
            }
            self.write_frame(term_id, frame_offset, flags, &remaining[..length]);
            frame_offset += align_frame_length(DATA_HEADER_LENGTH + length);
            remaining = &remaining[length..];
        }

        AppendOutcome::Appended { new_tail_offset: (offset + required) as i32 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{frame_length_volatile, LogBuffers};
    use crate::scanner;

    fn appender(log: &LogBuffers) -> TermAppender<'_> {
        TermAppender::new(log.term(0), log.meta(), 0)
    }

    #[test]
    fn appended_frames_are_aligned_and_committed() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let appender = appender(&log);

        let outcome = appender.append_unfragmented(&[7u8; 200], 1376);
        assert_eq!(outcome, AppendOutcome::Appended { new_tail_offset: 256 });

        let term = log.term(0);
        assert_eq!(frame_length_volatile(term, 0), 232);
        let header =
            DataHeader::decode(unsafe { term.bytes(0, DATA_HEADER_LENGTH) }).unwrap();
        assert_eq!(header.term_offset, 0);
        assert_eq!(header.term_id, 0);
        assert_eq!(header.session_id, 1);
        assert_eq!(header.stream_id, 2);

        let outcome = appender.append_unfragmented(&[8u8; 10], 1376);
        assert_eq!(outcome, AppendOutcome::Appended { new_tail_offset: 256 + 64 });
    }

    #[test]
    fn trip_pads_the_term_tail() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let appender = appender(&log);

        // Fill to within one frame of the end.
        let big = vec![0u8; 992]; // 1024-byte frames
        for _ in 0..63 {
            assert!(matches!(
                appender.append_unfragmented(&big, 1376),
                AppendOutcome::Appended { .. }
            ));
        }
        // 64 KiB - 63 KiB = 1 KiB left; a 2 KiB claim trips.
        let outcome = appender.append_fragmented(&vec![0u8; 1500], 992, 16 * 1024);
        assert_eq!(outcome, AppendOutcome::Tripped);

        // The remaining space is a committed padding frame.
        let term = log.term(0);
        let pad_offset = 63 * 1024;
        assert_eq!(frame_length_volatile(term, pad_offset), 1024);
        assert!(crate::layout::is_padding_frame(term, pad_offset));
    }

    #[test]
    fn fragments_carry_begin_and_end_flags() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let appender = appender(&log);

        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let outcome = appender.append_fragmented(&payload, 1000, 16 * 1024);
        assert!(matches!(outcome, AppendOutcome::Appended { .. }));

        let term = log.term(0);
        let first = DataHeader::decode(unsafe { term.bytes(0, DATA_HEADER_LENGTH) }).unwrap();
        assert_eq!(first.flags & BEGIN_FLAG, BEGIN_FLAG);
        assert_eq!(first.flags & END_FLAG, 0);

        let second_offset = align_frame_length(DATA_HEADER_LENGTH + 1000);
        let second = DataHeader::decode(unsafe {
            term.bytes(second_offset, DATA_HEADER_LENGTH)
        })
        .unwrap();
        assert_eq!(second.flags & (BEGIN_FLAG | END_FLAG), 0);

        let third_offset = 2 * second_offset;
        let third =
            DataHeader::decode(unsafe { term.bytes(third_offset, DATA_HEADER_LENGTH) }).unwrap();
        assert_eq!(third.flags & END_FLAG, END_FLAG);
        assert_eq!(third.frame_length as usize, DATA_HEADER_LENGTH + 500);
    }

    #[test]
    fn appended_bytes_are_scannable() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let appender = appender(&log);
        appender.append_unfragmented(&[1u8; 100], 1376);
        appender.append_unfragmented(&[2u8; 100], 1376);

        let outcome = scanner::scan_for_availability(log.term(0), 0, 4096);
        assert_eq!(outcome.available, 2 * 160);
        assert_eq!(outcome.padding, 0);
    }

    #[test]
    fn oversized_message_rejected() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 2);
        let appender = appender(&log);
        assert_eq!(
            appender.append_unfragmented(&[0u8; 2000], 1376),
            AppendOutcome::MaxMessageExceeded
        );
        assert_eq!(
            appender.append_fragmented(&vec![0u8; 32 * 1024], 1376, 16 * 1024),
            AppendOutcome::MaxMessageExceeded
        );
    }
}
