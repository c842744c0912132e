//! Log buffer layout: three term partitions plus a metadata region.

use std::io;
use std::path::Path;

use spate_primitives::mmap::MmapRegion;
use spate_primitives::region::{HeapRegion, Region};
use spate_primitives::sync::{AtomicI32, AtomicI64, Ordering};
use spate_primitives::{bits, is_power_of_two};
use spate_proto::{DataHeader, DATA_HEADER_LENGTH};

/// Number of term partitions in a log buffer.
pub const PARTITION_COUNT: usize = 3;

/// Minimum term buffer length.
pub const TERM_MIN_LENGTH: usize = 64 * 1024;

/// Maximum term buffer length.
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

/// Bytes reserved for the metadata region at the end of the log.
pub const LOG_META_DATA_LENGTH: usize = 4096;

/// The metadata region trailing the three term partitions.
///
/// Tail counters pack `term_id` in the high 32 bits and the (unclamped)
/// tail byte offset in the low 32; publishers claim with `fetch_add` so the
/// low half can run past the term length, and readers clamp.
#[repr(C)]
pub struct LogMetaData {
    /// Raw tail per partition.
    pub tail_counters: [AtomicI64; PARTITION_COUNT],
    _pad0: [u8; 40],
    /// Terms completed since the initial term; active partition is
    /// `active_term_count mod 3`.
    pub active_term_count: AtomicI32,
    _pad1: [u8; 60],
    /// Position at which the publisher closed the stream; `i64::MAX` while
    /// open.
    pub end_of_stream_position: AtomicI64,
    /// Non-zero while at least one subscriber position is registered.
    pub is_connected: AtomicI32,
    _pad2: [u8; 52],
    pub initial_term_id: i32,
    pub mtu_length: i32,
    pub term_length: i32,
    pub page_size: i32,
    _pad3: [u8; 48],
    /// Template applied to every claimed frame before stamping
    /// per-frame fields.
    pub default_frame_header: [u8; DATA_HEADER_LENGTH],
    _pad4: [u8; 32],
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<LogMetaData>() == 320);

/// Total file length for a given term length.
pub const fn compute_log_length(term_length: usize) -> usize {
    PARTITION_COUNT * term_length + LOG_META_DATA_LENGTH
}

/// Validate a term length per the protocol bounds.
pub fn check_term_length(term_length: usize) -> Result<(), &'static str> {
    if !is_power_of_two(term_length) {
        return Err("term length must be a power of two");
    }
    if term_length < TERM_MIN_LENGTH {
        return Err("term length below minimum (64 KiB)");
    }
    if term_length > TERM_MAX_LENGTH {
        return Err("term length above maximum (1 GiB)");
    }
    Ok(())
}

/// Pack a raw tail value.
#[inline]
pub const fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as i64 & 0xFFFF_FFFF)
}

/// Term id half of a raw tail.
#[inline]
pub const fn term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Tail offset half of a raw tail, clamped to the term length.
#[inline]
pub fn term_offset(raw_tail: i64, term_length: usize) -> i32 {
    let offset = raw_tail & 0xFFFF_FFFF;
    offset.min(term_length as i64) as i32
}

/// Partition index for a term count.
#[inline]
pub const fn index_by_term_count(term_count: i32) -> usize {
    (term_count.rem_euclid(PARTITION_COUNT as i32)) as usize
}

impl LogMetaData {
    /// Current active term count.
    #[inline]
    pub fn active_term_count(&self) -> i32 {
        self.active_term_count.load(Ordering::Acquire)
    }

    /// Raw tail of the currently active partition.
    #[inline]
    pub fn active_raw_tail(&self) -> i64 {
        self.tail_counters[index_by_term_count(self.active_term_count())].load(Ordering::Acquire)
    }

    #[inline]
    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    pub fn signal_end_of_stream(&self, position: i64) {
        self.end_of_stream_position.store(position, Ordering::Release);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire) != 0
    }

    pub fn set_connected(&self, connected: bool) {
        self.is_connected
            .store(if connected { 1 } else { 0 }, Ordering::Release);
    }
}

/// Rotate the log to the next term.
///
/// Resets the tail of the partition being recycled to `(term_id + 1, 0)`
/// and advances the active term count. Safe to race: the tail reset
/// compare-exchanges from the observed raw value and stops once any party
/// has stamped the new term id; a lost race on the count means another
/// party already rotated.
pub fn rotate_log(meta: &LogMetaData, current_term_count: i32, current_term_id: i32) -> bool {
    let next_term_id = current_term_id.wrapping_add(1);
    let next_index = index_by_term_count(current_term_count + 1);
    let counter = &meta.tail_counters[next_index];

    loop {
        let raw = counter.load(Ordering::Acquire);
        if term_id(raw) == next_term_id {
            break;
        }
        if counter
            .compare_exchange(raw, pack_tail(next_term_id, 0), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }

    meta.active_term_count
        .compare_exchange(
            current_term_count,
            current_term_count + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
}

enum Backing {
    Mmap(MmapRegion),
    Heap(HeapRegion),
}

/// An owned or attached log buffer.
pub struct LogBuffers {
    backing: Backing,
    term_length: usize,
}

impl LogBuffers {
    /// Create and initialise a file-backed log.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        path: &Path,
        term_length: usize,
        initial_term_id: i32,
        mtu_length: usize,
        page_size: usize,
        session_id: i32,
        stream_id: i32,
        pre_touch: bool,
    ) -> io::Result<Self> {
        check_term_length(term_length).map_err(io::Error::other)?;
        let mmap = MmapRegion::create(path, compute_log_length(term_length), pre_touch)?;
        let log = Self { backing: Backing::Mmap(mmap), term_length };
        log.initialise(initial_term_id, mtu_length, page_size, session_id, stream_id);
        Ok(log)
    }

    /// Attach to an existing log file; the term length is derived from the
    /// file length.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let mmap = MmapRegion::attach(path)?;
        if mmap.len() <= LOG_META_DATA_LENGTH
            || (mmap.len() - LOG_META_DATA_LENGTH) % PARTITION_COUNT != 0
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log file length does not fit 3 terms + metadata",
            ));
        }
        let term_length = (mmap.len() - LOG_META_DATA_LENGTH) / PARTITION_COUNT;
        check_term_length(term_length).map_err(io::Error::other)?;
        Ok(Self { backing: Backing::Mmap(mmap), term_length })
    }

    /// Heap-backed log for IPC streams and tests.
    pub fn heap(
        term_length: usize,
        initial_term_id: i32,
        mtu_length: usize,
        session_id: i32,
        stream_id: i32,
    ) -> Self {
        let heap = HeapRegion::new_zeroed(compute_log_length(term_length));
        let log = Self { backing: Backing::Heap(heap), term_length };
        log.initialise(initial_term_id, mtu_length, 4096, session_id, stream_id);
        log
    }

    fn initialise(
        &self,
        initial_term_id: i32,
        mtu_length: usize,
        page_size: usize,
        session_id: i32,
        stream_id: i32,
    ) {
        let region = self.region();
        let meta_offset = PARTITION_COUNT * self.term_length;
        // SAFETY: freshly created region, no concurrent access yet.
        let meta = unsafe { region.get_mut::<LogMetaData>(meta_offset) };
        meta.initial_term_id = initial_term_id;
        meta.mtu_length = mtu_length as i32;
        meta.term_length = self.term_length as i32;
        meta.page_size = page_size as i32;
        meta.default_frame_header = DataHeader::template(session_id, stream_id);
        meta.end_of_stream_position
            .store(i64::MAX, Ordering::Relaxed);

        // Seed partition 0 with the initial term; the other two carry the
        // term ids rotation will expect to replace.
        meta.tail_counters[0].store(pack_tail(initial_term_id, 0), Ordering::Relaxed);
        for index in 1..PARTITION_COUNT {
            let expired = initial_term_id + index as i32 - PARTITION_COUNT as i32;
            meta.tail_counters[index].store(pack_tail(expired, 0), Ordering::Relaxed);
        }
        meta.active_term_count.store(0, Ordering::Release);
    }

    /// Whole mapped region.
    pub fn region(&self) -> Region {
        match &self.backing {
            Backing::Mmap(mmap) => mmap.region(),
            Backing::Heap(heap) => heap.region(),
        }
    }

    /// The backing file path, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Mmap(mmap) => Some(mmap.path()),
            Backing::Heap(_) => None,
        }
    }

    /// Keep or delete the backing file when this mapping drops.
    pub fn set_owns_file(&mut self, owns: bool) {
        if let Backing::Mmap(mmap) = &mut self.backing {
            if owns {
                mmap.take_ownership();
            } else {
                mmap.release_ownership();
            }
        }
    }

    #[inline]
    pub fn term_length(&self) -> usize {
        self.term_length
    }

    /// One term partition.
    #[inline]
    pub fn term(&self, index: usize) -> Region {
        debug_assert!(index < PARTITION_COUNT);
        self.region().slice(index * self.term_length, self.term_length)
    }

    /// The metadata region.
    #[inline]
    pub fn meta(&self) -> &LogMetaData {
        // SAFETY: the metadata region was initialised at creation and all
        // mutable fields are atomics. `Region` is a bare pointer+len pair,
        // so the returned reference's validity is tied to `self`, not to
        // the temporary `Region` value the getter is called through.
        let region = self.region();
        unsafe { &*(region.offset(PARTITION_COUNT * self.term_length) as *const LogMetaData) }
    }

    #[inline]
    pub fn initial_term_id(&self) -> i32 {
        self.meta().initial_term_id
    }

    #[inline]
    pub fn mtu_length(&self) -> usize {
        self.meta().mtu_length as usize
    }
}

// ── frame field access within term buffers ───────────────────────────────────

/// Offset of the `flags` byte within a frame header.
pub const FRAME_FLAGS_OFFSET: usize = 5;
/// Offset of the `frame_type` field within a frame header.
pub const FRAME_TYPE_OFFSET: usize = 6;
/// Offset of the `term_offset` field within a data frame header.
pub const FRAME_TERM_OFFSET_OFFSET: usize = 8;
/// Offset of the `term_id` field within a data frame header.
pub const FRAME_TERM_ID_OFFSET: usize = 20;

/// Committed frame length at `offset`, acquire.
#[inline]
pub fn frame_length_volatile(term: Region, offset: usize) -> i32 {
    term.atomic_i32(offset).load(Ordering::Acquire)
}

/// Publish a frame by storing its length, release.
#[inline]
pub fn set_frame_length_ordered(term: Region, offset: usize, length: i32) {
    term.atomic_i32(offset).store(length, Ordering::Release);
}

/// Frame type field, plain read.
#[inline]
pub fn frame_type(term: Region, offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    term.get_bytes(offset + FRAME_TYPE_OFFSET, &mut bytes);
    u16::from_le_bytes(bytes)
}

#[inline]
pub fn is_padding_frame(term: Region, offset: usize) -> bool {
    frame_type(term, offset) == spate_proto::frame_type::PAD
}

/// Write a padding frame header over `[offset, offset + length)` and
/// publish it. Used by the appender on term trip, the unblocker, and the
/// gap filler.
pub fn write_padding_frame(
    term: Region,
    session_id: i32,
    stream_id: i32,
    term_id: i32,
    offset: usize,
    length: usize,
) {
    let mut header = [0u8; DATA_HEADER_LENGTH];
    DataHeader {
        frame_length: 0,
        flags: spate_proto::UNFRAGMENTED,
        frame_type: spate_proto::frame_type::PAD,
        term_offset: offset as i32,
        session_id,
        stream_id,
        term_id,
        reserved_value: 0,
    }
    .encode(&mut header);
    // Everything but the length, then the length, released.
    term.put_bytes(offset + 4, &header[4..]);
    set_frame_length_ordered(term, offset, length as i32);
}

/// Align a frame length up to [`spate_proto::FRAME_ALIGNMENT`].
#[inline]
pub fn align_frame_length(length: usize) -> usize {
    bits::align(length, spate_proto::FRAME_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_struct_is_320_bytes() {
        assert_eq!(core::mem::size_of::<LogMetaData>(), 320);
    }

    #[test]
    fn raw_tail_packing() {
        let raw = pack_tail(7, 4096);
        assert_eq!(term_id(raw), 7);
        assert_eq!(term_offset(raw, 64 * 1024), 4096);
        // Overshoot clamps to the term length.
        let raw = pack_tail(7, 80_000);
        assert_eq!(term_offset(raw, 64 * 1024), 64 * 1024);
    }

    #[test]
    fn heap_log_initialisation() {
        let log = LogBuffers::heap(64 * 1024, 100, 1408, 11, 22);
        let meta = log.meta();
        assert_eq!(meta.initial_term_id, 100);
        assert_eq!(meta.term_length, 64 * 1024);
        assert_eq!(term_id(meta.tail_counters[0].load(Ordering::Relaxed)), 100);
        assert_eq!(term_id(meta.tail_counters[1].load(Ordering::Relaxed)), 98);
        assert_eq!(term_id(meta.tail_counters[2].load(Ordering::Relaxed)), 99);
        assert_eq!(meta.end_of_stream_position(), i64::MAX);

        let header = DataHeader::decode(&meta.default_frame_header).unwrap();
        assert_eq!(header.session_id, 11);
        assert_eq!(header.stream_id, 22);
    }

    #[test]
    fn rotation_advances_active_term() {
        let log = LogBuffers::heap(64 * 1024, 10, 1408, 1, 1);
        let meta = log.meta();

        assert!(rotate_log(meta, 0, 10));
        assert_eq!(meta.active_term_count(), 1);
        assert_eq!(term_id(meta.tail_counters[1].load(Ordering::Relaxed)), 11);

        // A stale rotation attempt loses.
        assert!(!rotate_log(meta, 0, 10));
        assert_eq!(meta.active_term_count(), 1);
    }

    #[test]
    fn rotation_recycles_partitions_with_grown_tails() {
        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 1);
        let meta = log.meta();

        // Simulate appends far into each active term, then rotate through
        // a full cycle so partition 0 is recycled for term 3.
        for term_count in 0..4 {
            let index = index_by_term_count(term_count);
            meta.tail_counters[index].fetch_add(50_000, Ordering::AcqRel);
            assert!(rotate_log(meta, term_count, term_count));
            let next_index = index_by_term_count(term_count + 1);
            let raw = meta.tail_counters[next_index].load(Ordering::Acquire);
            assert_eq!(term_id(raw), term_count + 1);
            assert_eq!(term_offset(raw, 64 * 1024), 0);
        }
        assert_eq!(meta.active_term_count(), 4);
    }

    #[test]
    fn file_backed_create_and_attach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1001.logbuffer");

        let created =
            LogBuffers::create(&path, 64 * 1024, 5, 1408, 4096, 1, 2, false).unwrap();
        let attached = LogBuffers::attach(&path).unwrap();
        assert_eq!(attached.term_length(), 64 * 1024);
        assert_eq!(attached.initial_term_id(), 5);
        drop(attached);
        drop(created);
    }

    #[test]
    fn term_length_bounds() {
        assert!(check_term_length(64 * 1024).is_ok());
        assert!(check_term_length(32 * 1024).is_err());
        assert!(check_term_length(100_000).is_err());
        assert!(check_term_length(2 * 1024 * 1024 * 1024).is_err());
    }
}
