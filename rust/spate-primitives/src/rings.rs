//! Record-oriented ring buffers over a shared [`Region`].
//!
//! Both rings carry variable-length records laid out as
//! `[length: i32][msg_type: i32][payload ...]`, aligned to 8 bytes. The
//! `length` field covers the whole record including its 8-byte header and is
//! written **last** with a release store; consumers load it with acquire
//! before touching the type or payload. A zero length means the record has
//! been claimed but not yet committed, and the consumer stops there.
//!
//! A record never straddles the end of the buffer: a producer whose claim
//! would wrap first commits a padding record (`msg_type == PADDING_MSG_TYPE`)
//! covering the tail of the buffer and places the real record at offset 0.
//!
//! The buffer proper is a power-of-two number of bytes followed by a
//! [`RingDescriptor`] trailer whose hot fields sit on separate cache lines:
//!
//! - [`SpscRingBuffer`]: one producer. The tail is producer-private; only
//!   the committed length publishes data.
//! - [`MpscRingBuffer`]: producers claim space with a CAS on the tail. The
//!   producer that observes a straddle claims the padding bytes as part of
//!   the same CAS and writes the padding record itself.
//!
//! The consumer side is identical for both: walk committed records from
//! `head`, zero each consumed record, then advance `head` with a release
//! store so producers observe the zeroed space.

use core::mem::size_of;

use crate::bits::{align, is_power_of_two};
use crate::region::Region;
use crate::sync::{AtomicI64, AtomicU64, Ordering};

/// Record header length: `length: i32` + `msg_type: i32`.
pub const RECORD_HEADER_LENGTH: usize = 8;

/// Record alignment in the buffer.
pub const RECORD_ALIGNMENT: usize = 8;

/// Message type of a wrap padding record.
pub const PADDING_MSG_TYPE: i32 = -1;

/// Ring descriptor trailer. Lives directly after the buffer bytes.
#[repr(C)]
pub struct RingDescriptor {
    /// Producer claim position (monotonic byte count).
    pub tail: AtomicU64,
    _pad0: [u8; 56],
    /// Producer-side cache of the consumer position.
    pub head_cache: AtomicU64,
    _pad1: [u8; 56],
    /// Consumer position (monotonic byte count).
    pub head: AtomicU64,
    _pad2: [u8; 56],
    /// Shared correlation id generator for command rings.
    pub correlation_counter: AtomicI64,
    _pad3: [u8; 56],
    /// Timestamp the consumer last ran, for liveness checks by producers.
    pub consumer_heartbeat: AtomicI64,
    _pad4: [u8; 56],
}

/// Trailer size appended to the power-of-two buffer.
pub const TRAILER_LENGTH: usize = size_of::<RingDescriptor>();

#[cfg(not(loom))]
const _: () = assert!(TRAILER_LENGTH == 320);

/// Errors surfaced by ring writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingBufferError {
    /// Not enough free space for the record; back-pressure.
    InsufficientCapacity,
    /// Record larger than `max_msg_length`.
    MessageTooLong,
    /// The region does not hold a power-of-two buffer plus trailer.
    InvalidLayout,
}

impl std::fmt::Display for RingBufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RingBufferError::InsufficientCapacity => write!(f, "ring buffer is full"),
            RingBufferError::MessageTooLong => write!(f, "message exceeds max record length"),
            RingBufferError::InvalidLayout => write!(f, "region is not a valid ring layout"),
        }
    }
}

impl std::error::Error for RingBufferError {}

/// State shared by both ring flavours.
struct RingCore {
    region: Region,
    capacity: usize,
    mask: u64,
    descriptor_offset: usize,
    max_msg_length: usize,
}

impl RingCore {
    fn new(region: Region) -> Result<Self, RingBufferError> {
        if region.len() <= TRAILER_LENGTH {
            return Err(RingBufferError::InvalidLayout);
        }
        let capacity = region.len() - TRAILER_LENGTH;
        if !is_power_of_two(capacity) {
            return Err(RingBufferError::InvalidLayout);
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
    fn descriptor(&self) -> &RingDescriptor {
        // SAFETY: layout validated in `new`; the trailer is 8-byte aligned
        // because the buffer capacity is a power of two > 8.
        unsafe { self.region.get::<RingDescriptor>(self.descriptor_offset) }
    }

    #[inline]
    fn index(&self, position: u64) -> usize {
        (position & self.mask) as usize
    }

    /// Commit a record at `offset`: type + payload first, length last.
    fn commit(&self, offset: usize, msg_type: i32, payload: &[u8]) {
        self.region
            .put_bytes(offset + 4, &msg_type.to_le_bytes());
        self.region.put_bytes(offset + RECORD_HEADER_LENGTH, payload);
        let length = (RECORD_HEADER_LENGTH + payload.len()) as i32;
        self.region.atomic_i32(offset).store(length, Ordering::Release);
    }

    /// Commit a padding record covering `length` bytes at `offset`.
    fn commit_padding(&self, offset: usize, length: usize) {
        self.region
            .put_bytes(offset + 4, &PADDING_MSG_TYPE.to_le_bytes());
        self.region
            .atomic_i32(offset)
            .store(length as i32, Ordering::Release);
    }

    fn read(&self, mut handler: impl FnMut(i32, &[u8]), limit: usize) -> usize {
        let descriptor = self.descriptor();
        let head = descriptor.head.load(Ordering::Relaxed);

        let mut bytes_consumed = 0usize;
        let mut messages = 0usize;

        while messages < limit && bytes_consumed < self.capacity {
            let offset = self.index(head + bytes_consumed as u64);
            let length = self.region.atomic_i32(offset).load(Ordering::Acquire);
            if length <= 0 {
                break;
            }
            let record_length = align(length as usize, RECORD_ALIGNMENT);

            let mut type_bytes = [0u8; 4];
            self.region.get_bytes(offset + 4, &mut type_bytes);
            let msg_type = i32::from_le_bytes(type_bytes);
            if msg_type != PADDING_MSG_TYPE {
                let payload = unsafe {
                    self.region
                        .bytes(offset + RECORD_HEADER_LENGTH, length as usize - RECORD_HEADER_LENGTH)
                };
                handler(msg_type, payload);
                messages += 1;
            }

            // Zero the record so a later lap of the producer lands on an
            // uncommitted length.
            self.region.set_zero(offset, record_length);
            bytes_consumed += record_length;
        }

        if bytes_consumed > 0 {
            descriptor
                .head
                .store(head + bytes_consumed as u64, Ordering::Release);
        }

        messages
    }

    fn size(&self) -> usize {
        let descriptor = self.descriptor();
        let head = descriptor.head.load(Ordering::Acquire);
        let tail = descriptor.tail.load(Ordering::Acquire);
        tail.saturating_sub(head) as usize
    }

    fn required_length(&self, payload_len: usize) -> Result<usize, RingBufferError> {
        let required = align(RECORD_HEADER_LENGTH + payload_len, RECORD_ALIGNMENT);
        if required > self.max_msg_length {
            return Err(RingBufferError::MessageTooLong);
        }
        Ok(required)
    }
}

/// Single-producer, single-consumer record ring.
pub struct SpscRingBuffer {
    core: RingCore,
}

impl SpscRingBuffer {
    pub fn new(region: Region) -> Result<Self, RingBufferError> {
        Ok(Self { core: RingCore::new(region)? })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.core.max_msg_length
    }

    /// Bytes currently in flight between producer and consumer.
    pub fn size(&self) -> usize {
        self.core.size()
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.core
            .descriptor()
            .correlation_counter
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Append a record. Fails with back-pressure when the consumer lags.
    pub fn write(&self, msg_type: i32, payload: &[u8]) -> Result<(), RingBufferError> {
        let required = self.core.required_length(payload.len())?;
        let descriptor = self.core.descriptor();

        let tail = descriptor.tail.load(Ordering::Relaxed);
        let head = descriptor.head.load(Ordering::Acquire);

        let to_buffer_end = self.core.capacity - self.core.index(tail);
        let padding = if required > to_buffer_end { to_buffer_end } else { 0 };
        let total = required + padding;

        if tail + total as u64 - head > self.core.capacity as u64 {
            return Err(RingBufferError::InsufficientCapacity);
        }

        if padding > 0 {
            self.core.commit_padding(self.core.index(tail), padding);
        }
        self.core
            .commit(self.core.index(tail + padding as u64), msg_type, payload);
        descriptor
            .tail
            .store(tail + total as u64, Ordering::Release);
        Ok(())
    }

    /// Consume up to `limit` records, invoking `handler(msg_type, payload)`.
    pub fn read(&self, handler: impl FnMut(i32, &[u8]), limit: usize) -> usize {
        self.core.read(handler, limit)
    }

    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.core
            .descriptor()
            .consumer_heartbeat
            .load(Ordering::Acquire)
    }

    pub fn set_consumer_heartbeat_time(&self, now_ms: i64) {
        self.core
            .descriptor()
            .consumer_heartbeat
            .store(now_ms, Ordering::Release);
    }
}

/// Multi-producer, single-consumer record ring.
///
/// Producers race on the tail with compare-exchange; the winner of a claim
/// that straddles the buffer end also owns writing the padding record, which
/// its CAS claimed together with the message space.
pub struct MpscRingBuffer {
    core: RingCore,
}

impl MpscRingBuffer {
    pub fn new(region: Region) -> Result<Self, RingBufferError> {
        Ok(Self { core: RingCore::new(region)? })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    #[inline]
    pub fn max_msg_length(&self) -> usize {
        self.core.max_msg_length
    }

    pub fn size(&self) -> usize {
        self.core.size()
    }

    pub fn next_correlation_id(&self) -> i64 {
        self.core
            .descriptor()
            .correlation_counter
            .fetch_add(1, Ordering::Relaxed)
    }

    pub fn write(&self, msg_type: i32, payload: &[u8]) -> Result<(), RingBufferError> {
        let required = self.core.required_length(payload.len())?;
        let descriptor = self.core.descriptor();

        let (claimed_tail, padding) = loop {
            let tail = descriptor.tail.load(Ordering::Relaxed);
            let mut head = descriptor.head_cache.load(Ordering::Relaxed);

            let to_buffer_end = self.core.capacity - self.core.index(tail);
            let padding = if required > to_buffer_end { to_buffer_end } else { 0 };
            let total = (required + padding) as u64;

            if tail + total - head > self.core.capacity as u64 {
                head = descriptor.head.load(Ordering::Acquire);
                if tail + total - head > self.core.capacity as u64 {
                    return Err(RingBufferError::InsufficientCapacity);
                }
                descriptor.head_cache.store(head, Ordering::Relaxed);
            }

            if descriptor
                .tail
                .compare_exchange_weak(tail, tail + total, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break (tail, padding);
            }
        };

        if padding > 0 {
            self.core.commit_padding(self.core.index(claimed_tail), padding);
        }
        self.core.commit(
            self.core.index(claimed_tail + padding as u64),
            msg_type,
            payload,
        );
        Ok(())
    }

    pub fn read(&self, handler: impl FnMut(i32, &[u8]), limit: usize) -> usize {
        self.core.read(handler, limit)
    }

    pub fn consumer_heartbeat_time(&self) -> i64 {
        self.core
            .descriptor()
            .consumer_heartbeat
            .load(Ordering::Acquire)
    }

    pub fn set_consumer_heartbeat_time(&self, now_ms: i64) {
        self.core
            .descriptor()
            .consumer_heartbeat
            .store(now_ms, Ordering::Release);
    }
}

// SAFETY: all mutation happens through atomics or behind the claim protocol.
unsafe impl Send for SpscRingBuffer {}
unsafe impl Sync for SpscRingBuffer {}
unsafe impl Send for MpscRingBuffer {}
unsafe impl Sync for MpscRingBuffer {}
