//! Shared-memory counters: a metadata region describing each counter and a
//! values region holding the 8-byte values themselves.
//!
//! The driver conductor is the only allocator; clients and tools map the
//! two regions read-only and observe values with acquire loads. Each value
//! sits on its own pair of cache lines so independent writers never share a
//! line.

use core::mem::size_of;

use crate::region::Region;
use crate::sync::{AtomicI32, AtomicI64, Ordering};

/// Bytes reserved per counter value (value + padding).
pub const COUNTER_LENGTH: usize = 2 * crate::bits::CACHE_LINE_LENGTH;

/// Bytes reserved per counter metadata record.
pub const METADATA_LENGTH: usize = 256;

/// Space for the opaque key within a metadata record.
pub const KEY_LENGTH: usize = 112;

/// Space for the label within a metadata record.
pub const MAX_LABEL_LENGTH: usize = 124;

/// Metadata record states.
pub const RECORD_UNUSED: i32 = 0;
pub const RECORD_ALLOCATED: i32 = 1;
pub const RECORD_RECLAIMED: i32 = -1;

/// One metadata record. The `state` field publishes the rest: it is stored
/// with release after the record is filled in and loaded with acquire by
/// readers.
#[repr(C)]
pub struct CounterMetadata {
    pub state: AtomicI32,
    pub type_id: i32,
    pub free_for_reuse_deadline_ms: i64,
    pub key: [u8; KEY_LENGTH],
    pub label_length: i32,
    pub label: [u8; MAX_LABEL_LENGTH],
}

#[cfg(not(loom))]
const _: () = assert!(size_of::<CounterMetadata>() == METADATA_LENGTH);

/// Writer handle for one counter value.
///
/// Counters are single-writer; reads from other threads and processes use
/// [`CountersReader`].
#[derive(Clone, Copy)]
pub struct AtomicCounter {
    values: Region,
    id: i32,
}

impl AtomicCounter {
    pub fn new(values: Region, id: i32) -> Self {
        Self { values, id }
    }

    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    fn cell(&self) -> &AtomicI64 {
        self.values.atomic_i64(self.id as usize * COUNTER_LENGTH)
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.cell().load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.cell().store(value, Ordering::Release);
    }

    #[inline]
    pub fn add(&self, amount: i64) -> i64 {
        self.cell().fetch_add(amount, Ordering::Release)
    }

    #[inline]
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Raise the counter to `proposed` if it is greater than the current
    /// value. Single-writer, so a plain read-compare-store suffices.
    #[inline]
    pub fn propose_max(&self, proposed: i64) -> bool {
        if self.cell().load(Ordering::Relaxed) < proposed {
            self.cell().store(proposed, Ordering::Release);
            return true;
        }
        false
    }
}

/// Allocator for counters. Owned by the conductor.
pub struct CountersManager {
    metadata: Region,
    values: Region,
    max_counters: usize,
    high_water: usize,
    free_list: Vec<i32>,
    reuse_cooldown_ms: i64,
}

impl CountersManager {
    pub fn new(metadata: Region, values: Region, reuse_cooldown_ms: i64) -> Self {
        let by_metadata = metadata.len() / METADATA_LENGTH;
        let by_values = values.len() / COUNTER_LENGTH;
        Self {
            metadata,
            values,
            max_counters: by_metadata.min(by_values),
            high_water: 0,
            free_list: Vec::new(),
            reuse_cooldown_ms,
        }
    }

    #[inline]
    fn record(&self, id: i32) -> &CounterMetadata {
        // SAFETY: id < max_counters checked at allocation; records are
        // METADATA_LENGTH-aligned within the region.
        unsafe { self.metadata.get::<CounterMetadata>(id as usize * METADATA_LENGTH) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn record_mut(&self, id: i32) -> &mut CounterMetadata {
        unsafe { self.metadata.get_mut::<CounterMetadata>(id as usize * METADATA_LENGTH) }
    }

    /// Allocate a counter, returning its id.
    pub fn allocate(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
        now_ms: i64,
    ) -> Result<AtomicCounter, &'static str> {
        if key.len() > KEY_LENGTH {
            return Err("counter key too long");
        }

        let id = self.next_id(now_ms)?;

        // SAFETY: sole writer; readers are gated on the state release below.
        let record = unsafe { self.record_mut(id) };
        record.type_id = type_id;
        record.free_for_reuse_deadline_ms = 0;
        record.key = [0; KEY_LENGTH];
        record.key[..key.len()].copy_from_slice(key);
        let label_bytes = label.as_bytes();
        let label_length = label_bytes.len().min(MAX_LABEL_LENGTH);
        record.label = [0; MAX_LABEL_LENGTH];
        record.label[..label_length].copy_from_slice(&label_bytes[..label_length]);
        record.label_length = label_length as i32;

        let counter = AtomicCounter::new(self.values, id);
        counter.set(0);
        record.state.store(RECORD_ALLOCATED, Ordering::Release);
        Ok(counter)
    }

    fn next_id(&mut self, now_ms: i64) -> Result<i32, &'static str> {
        if let Some(pos) = self.free_list.iter().position(|&id| {
            self.record(id).free_for_reuse_deadline_ms <= now_ms
        }) {
            return Ok(self.free_list.swap_remove(pos));
        }
        if self.high_water >= self.max_counters {
            return Err("counters exhausted");
        }
        let id = self.high_water as i32;
        self.high_water += 1;
        Ok(id)
    }

    /// Free a counter. Its id is withheld from reuse for the cooldown so
    /// stale readers do not misattribute values.
    pub fn free(&mut self, id: i32, now_ms: i64) {
        let record = unsafe { self.record_mut(id) };
        record.free_for_reuse_deadline_ms = now_ms + self.reuse_cooldown_ms;
        record.state.store(RECORD_RECLAIMED, Ordering::Release);
        self.free_list.push(id);
    }

    /// Writer handle for an already-allocated counter.
    pub fn counter(&self, id: i32) -> AtomicCounter {
        AtomicCounter::new(self.values, id)
    }

    pub fn max_counters(&self) -> usize {
        self.max_counters
    }
}

/// Read-only view over the two counter regions.
pub struct CountersReader {
    metadata: Region,
    values: Region,
    max_counters: usize,
}

impl CountersReader {
    pub fn new(metadata: Region, values: Region) -> Self {
        let by_metadata = metadata.len() / METADATA_LENGTH;
        let by_values = values.len() / COUNTER_LENGTH;
        Self { metadata, values, max_counters: by_metadata.min(by_values) }
    }

    pub fn counter_value(&self, id: i32) -> i64 {
        self.values
            .atomic_i64(id as usize * COUNTER_LENGTH)
            .load(Ordering::Acquire)
    }

    /// Visit every allocated counter as `(id, type_id, key, label)`.
    pub fn for_each(&self, mut handler: impl FnMut(i32, i32, &[u8], &str)) {
        for id in 0..self.max_counters as i32 {
            let record =
                unsafe { self.metadata.get::<CounterMetadata>(id as usize * METADATA_LENGTH) };
            if record.state.load(Ordering::Acquire) != RECORD_ALLOCATED {
                continue;
            }
            let label_length = (record.label_length as usize).min(MAX_LABEL_LENGTH);
            let label = std::str::from_utf8(&record.label[..label_length]).unwrap_or("");
            handler(id, record.type_id, &record.key, label);
        }
    }

    /// Find the first allocated counter matching `predicate` on
    /// `(type_id, key)`.
    pub fn find(&self, mut predicate: impl FnMut(i32, &[u8]) -> bool) -> Option<i32> {
        let mut found = None;
        self.for_each(|id, type_id, key, _| {
            if found.is_none() && predicate(type_id, key) {
                found = Some(id);
            }
        });
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn manager() -> (HeapRegion, HeapRegion, CountersManager) {
        let metadata = HeapRegion::new_zeroed(METADATA_LENGTH * 16);
        let values = HeapRegion::new_zeroed(COUNTER_LENGTH * 16);
        let manager = CountersManager::new(metadata.region(), values.region(), 1000);
        (metadata, values, manager)
    }

    #[test]
    fn allocate_and_read_back() {
        let (metadata, values, mut manager) = manager();
        let counter = manager
            .allocate(2, &42i64.to_le_bytes(), "sender-pos: 42", 0)
            .unwrap();
        counter.set(1234);

        let reader = CountersReader::new(metadata.region(), values.region());
        assert_eq!(reader.counter_value(counter.id()), 1234);

        let mut labels = Vec::new();
        reader.for_each(|id, type_id, key, label| {
            labels.push((id, type_id, key[..8].to_vec(), label.to_string()));
        });
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].1, 2);
        assert_eq!(labels[0].2, 42i64.to_le_bytes().to_vec());
        assert_eq!(labels[0].3, "sender-pos: 42");
    }

    #[test]
    fn freed_id_respects_cooldown() {
        let (_m, _v, mut manager) = manager();
        let counter = manager.allocate(1, &[], "a", 0).unwrap();
        let id = counter.id();
        manager.free(id, 100);

        // Before the deadline a fresh id is handed out.
        let next = manager.allocate(1, &[], "b", 200).unwrap();
        assert_ne!(next.id(), id);

        // After the deadline the freed id is reused.
        let reused = manager.allocate(1, &[], "c", 1200).unwrap();
        assert_eq!(reused.id(), id);
    }

    #[test]
    fn propose_max_is_monotonic() {
        let (_m, _v, mut manager) = manager();
        let counter = manager.allocate(1, &[], "hwm", 0).unwrap();
        assert!(counter.propose_max(10));
        assert!(!counter.propose_max(5));
        assert_eq!(counter.get(), 10);
    }

    #[test]
    fn exhaustion_is_reported() {
        let (_m, _v, mut manager) = manager();
        for i in 0..16 {
            manager.allocate(1, &[], &format!("c{i}"), 0).unwrap();
        }
        assert!(manager.allocate(1, &[], "overflow", 0).is_err());
    }
}
