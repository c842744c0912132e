//! One-to-many broadcast over a shared region.
//!
//! The driver conductor publishes client-facing events here. Unlike the
//! rings, the transmitter **never blocks and never fails on a slow reader**:
//! each reader keeps a private cursor and a reader that falls more than a
//! buffer's worth behind is lapped. A lapped reader learns so on its next
//! receive and re-synchronises to the transmitter's current tail.
//!
//! Record layout matches the rings: `[length: i32][msg_type: i32][payload]`
//! aligned to 8 bytes, padding record at the buffer end so records never
//! wrap. Because the transmitter overwrites without coordination, a reader
//! copies the record out and then validates its cursor against the
//! transmitter's *intent* position (advanced before the overwrite begins);
//! a copy that raced an overwrite is discarded as a lap.

use core::mem::size_of;

use crate::bits::{align, is_power_of_two};
use crate::region::Region;
use crate::rings::{PADDING_MSG_TYPE, RECORD_ALIGNMENT, RECORD_HEADER_LENGTH};
use crate::sync::{fence, AtomicU64, Ordering};

/// Broadcast descriptor trailer.
#[repr(C)]
pub struct BroadcastDescriptor {
    /// Position the transmitter is about to write up to. Advanced before
    /// any buffer bytes are touched.
    pub tail_intent: AtomicU64,
    _pad0: [u8; 56],
    /// Position up to which records are committed.
    pub tail: AtomicU64,
    _pad1: [u8; 56],
}

/// Trailer size appended to the power-of-two buffer.
pub const BROADCAST_TRAILER_LENGTH: usize = size_of::<BroadcastDescriptor>();

#[cfg(not(loom))]
const _: () = assert!(BROADCAST_TRAILER_LENGTH == 128);

/// Error from [`BroadcastTransmitter::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTooLong;

impl std::fmt::Display for MessageTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "message exceeds broadcast max record length")
    }
}

impl std::error::Error for MessageTooLong {}

/// Outcome of a [`BroadcastReceiver::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastReceive {
    /// No new records.
    Idle,
    /// A record was copied out and passed to the handler.
    Message,
    /// The reader fell behind by more than the buffer capacity; the cursor
    /// has been re-synchronised to the current tail.
    Lapped,
}

/// The single producer side of the broadcast buffer.
pub struct BroadcastTransmitter {
    region: Region,
    capacity: usize,
    mask: u64,
    descriptor_offset: usize,
    max_msg_length: usize,
}

impl BroadcastTransmitter {
    pub fn new(region: Region) -> Result<Self, &'static str> {
        if region.len() <= BROADCAST_TRAILER_LENGTH {
            return Err("broadcast region too small");
        }
        let capacity = region.len() - BROADCAST_TRAILER_LENGTH;
        if !is_power_of_two(capacity) {
            return Err("broadcast capacity must be a power of two");
        }
        Ok(Self {
            region,
            capacity,
            mask: (capacity - 1) as u64,
            descriptor_offset: capacity,
            max_msg_length: capacity / 8,
        })
    }

    #[inline]
    fn descriptor(&self) -> &BroadcastDescriptor {
        unsafe { self.region.get::<BroadcastDescriptor>(self.descriptor_offset) }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.max_msg_length
    }

    /// Publish a record. Slow readers are lapped, never waited on.
    pub fn transmit(&self, msg_type: i32, payload: &[u8]) -> Result<(), MessageTooLong> {
        let required = align(RECORD_HEADER_LENGTH + payload.len(), RECORD_ALIGNMENT);
        if required > self.max_msg_length {
            return Err(MessageTooLong);
        }

        let descriptor = self.descriptor();
        let tail = descriptor.tail.load(Ordering::Relaxed);

        let to_buffer_end = self.capacity - (tail & self.mask) as usize;
        let padding = if required > to_buffer_end { to_buffer_end } else { 0 };
        let new_tail = tail + (required + padding) as u64;

        // Declare the overwrite range before touching buffer bytes, so a
        // reader copying concurrently will detect the lap. The release
        // fence keeps the intent store ahead of the record writes on
        // weakly-ordered machines.
        descriptor.tail_intent.store(new_tail, Ordering::Relaxed);
        fence(Ordering::Release);

        let mut offset = (tail & self.mask) as usize;
        if padding > 0 {
            self.region
                .put_bytes(offset + 4, &PADDING_MSG_TYPE.to_le_bytes());
            self.region
                .atomic_i32(offset)
                .store(padding as i32, Ordering::Release);
            offset = 0;
        }

        self.region.put_bytes(offset + 4, &msg_type.to_le_bytes());
        self.region.put_bytes(offset + RECORD_HEADER_LENGTH, payload);
        self.region
            .atomic_i32(offset)
            .store((RECORD_HEADER_LENGTH + payload.len()) as i32, Ordering::Release);

        descriptor.tail.store(new_tail, Ordering::Release);
        Ok(())
    }
}

unsafe impl Send for BroadcastTransmitter {}
unsafe impl Sync for BroadcastTransmitter {}

/// An independent reader over the broadcast buffer.
///
/// Each client holds its own receiver; receivers never coordinate.
pub struct BroadcastReceiver {
    region: Region,
    capacity: usize,
    mask: u64,
    descriptor_offset: usize,
    cursor: u64,
    scratch: Vec<u8>,
}

impl BroadcastReceiver {
    pub fn new(region: Region) -> Result<Self, &'static str> {
        if region.len() <= BROADCAST_TRAILER_LENGTH {
            return Err("broadcast region too small");
        }
        let capacity = region.len() - BROADCAST_TRAILER_LENGTH;
        if !is_power_of_two(capacity) {
            return Err("broadcast capacity must be a power of two");
        }
        let descriptor_offset = capacity;
        let cursor = unsafe { region.get::<BroadcastDescriptor>(descriptor_offset) }
            .tail
            .load(Ordering::Acquire);
        Ok(Self {
            region,
            capacity,
            mask: (capacity - 1) as u64,
            descriptor_offset,
            cursor,
            scratch: Vec::new(),
        })
    }

    #[inline]
    fn descriptor(&self) -> &BroadcastDescriptor {
        unsafe { self.region.get::<BroadcastDescriptor>(self.descriptor_offset) }
    }

    /// Attempt to receive the next record.
    ///
    /// On [`BroadcastReceive::Lapped`] the handler is not invoked and the
    /// cursor now points at the transmitter's latest committed tail;
    /// records between the old cursor and there are lost to this reader.
    pub fn receive(&mut self, mut handler: impl FnMut(i32, &[u8])) -> BroadcastReceive {
        loop {
            let descriptor = self.descriptor();
            let tail = descriptor.tail.load(Ordering::Acquire);
            if self.cursor == tail {
                return BroadcastReceive::Idle;
            }

            if descriptor.tail_intent.load(Ordering::Acquire) - self.cursor > self.capacity as u64 {
                self.cursor = tail;
                return BroadcastReceive::Lapped;
            }

            let offset = (self.cursor & self.mask) as usize;
            let length = self.region.atomic_i32(offset).load(Ordering::Acquire) as usize;
            if length < RECORD_HEADER_LENGTH || length > self.capacity {
                // Only possible mid-overwrite; treat as a lap.
                self.cursor = descriptor.tail.load(Ordering::Acquire);
                return BroadcastReceive::Lapped;
            }
            let mut type_bytes = [0u8; 4];
            self.region.get_bytes(offset + 4, &mut type_bytes);
            let msg_type = i32::from_le_bytes(type_bytes);

            let payload_length = length.saturating_sub(RECORD_HEADER_LENGTH);
            if msg_type != PADDING_MSG_TYPE {
                self.scratch.resize(payload_length, 0);
                self.region
                    .get_bytes(offset + RECORD_HEADER_LENGTH, &mut self.scratch);
            }

            // Validate after the copy: if the transmitter's intent has moved
            // past our cursor's lap window, the bytes we copied may be torn.
            fence(Ordering::Acquire);
            let descriptor = self.descriptor();
            if descriptor.tail_intent.load(Ordering::Relaxed) - self.cursor > self.capacity as u64 {
                self.cursor = descriptor.tail.load(Ordering::Acquire);
                return BroadcastReceive::Lapped;
            }

            self.cursor += align(length, RECORD_ALIGNMENT) as u64;
            if msg_type == PADDING_MSG_TYPE {
                continue;
            }

            handler(msg_type, &self.scratch[..payload_length]);
            return BroadcastReceive::Message;
        }
    }
}

unsafe impl Send for BroadcastReceiver {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn setup(capacity: usize) -> (HeapRegion, BroadcastTransmitter) {
        let heap = HeapRegion::new_zeroed(capacity + BROADCAST_TRAILER_LENGTH);
        let tx = BroadcastTransmitter::new(heap.region()).unwrap();
        (heap, tx)
    }

    #[test]
    fn single_record_roundtrip() {
        let (heap, tx) = setup(1024);
        let mut rx = BroadcastReceiver::new(heap.region()).unwrap();

        tx.transmit(5, b"event").unwrap();

        let mut seen = None;
        assert_eq!(
            rx.receive(|t, p| seen = Some((t, p.to_vec()))),
            BroadcastReceive::Message
        );
        assert_eq!(seen, Some((5, b"event".to_vec())));
        assert_eq!(rx.receive(|_, _| panic!()), BroadcastReceive::Idle);
    }

    #[test]
    fn reader_joins_at_current_tail() {
        let (heap, tx) = setup(1024);
        tx.transmit(1, b"before").unwrap();

        let mut rx = BroadcastReceiver::new(heap.region()).unwrap();
        assert_eq!(rx.receive(|_, _| panic!()), BroadcastReceive::Idle);

        tx.transmit(2, b"after").unwrap();
        let mut seen = None;
        rx.receive(|t, _| seen = Some(t));
        assert_eq!(seen, Some(2));
    }

    #[test]
    fn wrap_padding_is_skipped() {
        let (heap, tx) = setup(256);
        let mut rx = BroadcastReceiver::new(heap.region()).unwrap();

        for round in 0..40i32 {
            tx.transmit(round, &[round as u8; 20]).unwrap();
            let mut seen = None;
            assert_eq!(
                rx.receive(|t, p| seen = Some((t, p.len()))),
                BroadcastReceive::Message
            );
            assert_eq!(seen, Some((round, 20)));
        }
    }

    #[test]
    fn slow_reader_is_lapped_then_resumes() {
        let (heap, tx) = setup(256);
        let mut rx = BroadcastReceiver::new(heap.region()).unwrap();

        // Write more than a buffer's worth while the reader sleeps.
        for round in 0..64i32 {
            tx.transmit(round, &[0u8; 24]).unwrap();
        }

        assert_eq!(rx.receive(|_, _| panic!("lapped reader got a record")), BroadcastReceive::Lapped);

        // After resync the reader sees newly transmitted records again.
        tx.transmit(99, b"fresh").unwrap();
        let mut seen = None;
        assert_eq!(rx.receive(|t, _| seen = Some(t)), BroadcastReceive::Message);
        assert_eq!(seen, Some(99));
    }
}
