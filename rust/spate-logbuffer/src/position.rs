//! Stream position arithmetic.
//!
//! A position is a 64-bit monotonic cursor over the whole stream:
//! `((term_id - initial_term_id) << bits) | term_offset` where
//! `bits = log2(term_length)`. Positions are the one currency every part of
//! the driver trades in — publisher tail, sender position, rebuild
//! position, subscriber position, high-water mark.

/// Shift for a power-of-two term length.
#[inline]
pub fn position_bits_to_shift(term_length: usize) -> u32 {
    debug_assert!(term_length.is_power_of_two());
    term_length.trailing_zeros()
}

/// Position of `(term_id, term_offset)` within the stream.
#[inline]
pub fn compute_position(
    term_id: i32,
    term_offset: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    let term_count = (term_id.wrapping_sub(initial_term_id)) as i64;
    (term_count << position_bits_to_shift) + term_offset as i64
}

/// Position of the start of `term_id`.
#[inline]
pub fn compute_term_begin_position(
    term_id: i32,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i64 {
    compute_position(term_id, 0, position_bits_to_shift, initial_term_id)
}

/// Term id containing `position`.
#[inline]
pub fn compute_term_id_from_position(
    position: i64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
) -> i32 {
    ((position >> position_bits_to_shift) as i32).wrapping_add(initial_term_id)
}

/// Offset within its term of `position`.
#[inline]
pub fn compute_term_offset_from_position(position: i64, position_bits_to_shift: u32) -> i32 {
    (position & ((1i64 << position_bits_to_shift) - 1)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_roundtrip() {
        let bits = position_bits_to_shift(64 * 1024);
        assert_eq!(bits, 16);

        let position = compute_position(12, 4096, bits, 10);
        assert_eq!(position, 2 * 64 * 1024 + 4096);
        assert_eq!(compute_term_id_from_position(position, bits, 10), 12);
        assert_eq!(compute_term_offset_from_position(position, bits), 4096);
    }

    #[test]
    fn begin_position_is_offset_zero() {
        let bits = position_bits_to_shift(128 * 1024);
        assert_eq!(compute_term_begin_position(5, bits, 5), 0);
        assert_eq!(compute_term_begin_position(6, bits, 5), 128 * 1024);
    }

    #[test]
    fn wrapped_term_ids() {
        // Term ids may wrap through i32::MAX over a long stream life.
        let bits = position_bits_to_shift(64 * 1024);
        let initial = i32::MAX - 1;
        let position = compute_position(initial.wrapping_add(3), 32, bits, initial);
        assert_eq!(position, 3 * 64 * 1024 + 32);
    }
}
