//! Lock-free shared-memory primitives for the spate media driver.
//!
//! Everything in this crate operates on a [`Region`] — a raw view of bytes
//! that may live on the heap (tests, intra-process queues) or in a
//! memory-mapped file shared with client processes. The structures here are
//! the only inter-thread and inter-process communication mechanisms the
//! driver is allowed to use:
//!
//! - [`rings`]: single- and multi-producer ring buffers carrying
//!   length-prefixed records
//! - [`broadcast`]: one-to-many transmitter where slow readers are lapped
//!   rather than blocking the producer
//! - [`counters`]: the shared counters file (metadata + values)
//! - [`error_log`]: the distinct error log
//!
//! All of them publish a record by a release store of its length field and
//! consume it behind an acquire load of the same field; payload bytes are
//! never read before that load observes a positive length.

pub mod bits;
pub mod broadcast;
pub mod counters;
pub mod error_log;
pub mod mmap;
pub mod region;
pub mod rings;
pub mod spsc_queue;
pub mod sync;

pub use bits::{align, is_power_of_two, CACHE_LINE_LENGTH};
pub use broadcast::{BroadcastReceive, BroadcastReceiver, BroadcastTransmitter};
pub use counters::{AtomicCounter, CountersManager, CountersReader};
pub use error_log::{DistinctErrorLog, ErrorLogReader};
pub use mmap::MmapRegion;
pub use region::{HeapRegion, Region};
pub use rings::{MpscRingBuffer, RingBufferError, SpscRingBuffer};
pub use spsc_queue::SpscQueue;
