//! Term unblocker.
//!
//! A publisher that claims space and dies before committing leaves a zero
//! `frame_length` at the head of the stream; every consumer stalls behind
//! it forever. After the publication unblock timeout the conductor calls
//! this to write a padding frame over the dead claim. The position-limit
//! contract guarantees no live producer can still commit there once the
//! limit is frozen, so the overwrite is safe.

use spate_primitives::region::Region;

use crate::layout::{frame_length_volatile, write_padding_frame};
use spate_proto::FRAME_ALIGNMENT;

/// Outcome of an unblock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockStatus {
    /// Nothing blocked, or not yet provably abandoned.
    NoAction,
    /// A padding frame now covers the dead claim.
    Unblocked,
    /// The rest of the term was padded; the caller should rotate.
    UnblockedToEnd,
}

/// Attempt to unblock at `blocked_offset`, where the producer tail has
/// reached `tail_offset`.
///
/// With `force` unset, the gap is only padded when a committed frame
/// exists beyond it (proof the claimant died mid-stream) or the term is
/// full. With `force` set (unblock timeout expired) a trailing gap is
/// padded up to the tail as well.
#[allow(clippy::too_many_arguments)]
pub fn unblock(
    term: Region,
    session_id: i32,
    stream_id: i32,
    term_id: i32,
    blocked_offset: usize,
    tail_offset: usize,
    force: bool,
) -> UnblockStatus {
    let term_length = term.len();
    let tail = tail_offset.min(term_length);

    if blocked_offset >= tail || frame_length_volatile(term, blocked_offset) != 0 {
        return UnblockStatus::NoAction;
    }

    // Look for a committed frame beyond the dead claim.
    let mut scan = blocked_offset + FRAME_ALIGNMENT;
    while scan < tail {
        if frame_length_volatile(term, scan) != 0 {
            write_padding_frame(
                term,
                session_id,
                stream_id,
                term_id,
                blocked_offset,
                scan - blocked_offset,
            );
            return UnblockStatus::Unblocked;
        }
        scan += FRAME_ALIGNMENT;
    }

    if tail_offset >= term_length {
        // Term is full; pad out the remainder so consumers can rotate.
        write_padding_frame(
            term,
            session_id,
            stream_id,
            term_id,
            blocked_offset,
            term_length - blocked_offset,
        );
        return UnblockStatus::UnblockedToEnd;
    }

    if force {
        write_padding_frame(
            term,
            session_id,
            stream_id,
            term_id,
            blocked_offset,
            tail - blocked_offset,
        );
        return UnblockStatus::Unblocked;
    }

    UnblockStatus::NoAction
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{is_padding_frame, LogBuffers};
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
    fn no_action_on_committed_head() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        rebuilder::insert(term, 0, &frame(0, 32));
        assert_eq!(unblock(term, 1, 1, 0, 0, 64, false), UnblockStatus::NoAction);
    }

    #[test]
    fn dead_claim_before_committed_frame_is_padded() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        // Claimant of [0, 128) died; a later producer committed [128, 192).
        rebuilder::insert(term, 128, &frame(128, 32));

        assert_eq!(unblock(term, 1, 1, 0, 0, 192, false), UnblockStatus::Unblocked);
        assert_eq!(frame_length_volatile(term, 0), 128);
        assert!(is_padding_frame(term, 0));
    }

    #[test]
    fn trailing_gap_needs_force() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        // Claim of [0, 256) with nothing after it: not provably dead.
        assert_eq!(unblock(term, 1, 1, 0, 0, 256, false), UnblockStatus::NoAction);

        // After the unblock timeout the conductor forces it.
        assert_eq!(unblock(term, 1, 1, 0, 0, 256, true), UnblockStatus::Unblocked);
        assert_eq!(frame_length_volatile(term, 0), 256);
        assert!(is_padding_frame(term, 0));
    }

    #[test]
    fn full_term_is_padded_to_end() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let term = log.term(0);
        let blocked = 64 * 1024 - 128;
        assert_eq!(
            unblock(term, 1, 1, 0, blocked, 64 * 1024, false),
            UnblockStatus::UnblockedToEnd
        );
        assert_eq!(frame_length_volatile(term, blocked), 128);
    }
}
