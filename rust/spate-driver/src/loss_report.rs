//! Loss report: a shared-memory record of where loss was observed.
//!
//! One entry per `(session, stream, channel)` that ever lost bytes; the
//! receiver updates totals in place. Entries are published by a release
//! store of the observation count, mirroring the error log protocol.
//!
//! ```text
//! [observation_count: i64][total_bytes_lost: i64][first_ms: i64]
//! [last_ms: i64][session_id: i32][stream_id: i32]
//! [channel_len: i32][channel ...][source_len: i32][source ...]
//! ```

use spate_primitives::bits::align;
use spate_primitives::region::Region;
use spate_primitives::sync::Ordering;

const OBSERVATION_COUNT_OFFSET: usize = 0;
const TOTAL_BYTES_OFFSET: usize = 8;
const FIRST_OBSERVATION_OFFSET: usize = 16;
const LAST_OBSERVATION_OFFSET: usize = 24;
const SESSION_ID_OFFSET: usize = 32;
const STREAM_ID_OFFSET: usize = 36;
const CHANNEL_LENGTH_OFFSET: usize = 40;

const ENTRY_ALIGNMENT: usize = 8;

/// Writer side, owned by the receiver agent.
pub struct LossReporter {
    region: Region,
    next_offset: usize,
}

/// Handle to one entry for in-place updates.
#[derive(Debug, Clone, Copy)]
pub struct LossEntry {
    offset: usize,
}

impl LossReporter {
    pub fn new(region: Region) -> Self {
        Self { region, next_offset: 0 }
    }

    /// Create an entry recording an initial observation.
    ///
    /// Returns `None` when the report buffer is full.
    pub fn create_entry(
        &mut self,
        bytes_lost: i64,
        now_ms: i64,
        session_id: i32,
        stream_id: i32,
        channel: &str,
        source: &str,
    ) -> Option<LossEntry> {
        let channel_bytes = channel.as_bytes();
        let source_bytes = source.as_bytes();
        let length =
            CHANNEL_LENGTH_OFFSET + 4 + channel_bytes.len() + 4 + source_bytes.len();
        let aligned = align(length, ENTRY_ALIGNMENT);
        if self.next_offset + aligned > self.region.len() {
            return None;
        }

        let offset = self.next_offset;
        self.region
            .atomic_i64(offset + TOTAL_BYTES_OFFSET)
            .store(bytes_lost, Ordering::Relaxed);
        self.region
            .atomic_i64(offset + FIRST_OBSERVATION_OFFSET)
            .store(now_ms, Ordering::Relaxed);
        self.region
            .atomic_i64(offset + LAST_OBSERVATION_OFFSET)
            .store(now_ms, Ordering::Relaxed);
        self.region
            .put_bytes(offset + SESSION_ID_OFFSET, &session_id.to_le_bytes());
        self.region
            .put_bytes(offset + STREAM_ID_OFFSET, &stream_id.to_le_bytes());
        self.region.put_bytes(
            offset + CHANNEL_LENGTH_OFFSET,
            &(channel_bytes.len() as i32).to_le_bytes(),
        );
        let mut cursor = offset + CHANNEL_LENGTH_OFFSET + 4;
        self.region.put_bytes(cursor, channel_bytes);
        cursor += channel_bytes.len();
        self.region
            .put_bytes(cursor, &(source_bytes.len() as i32).to_le_bytes());
        self.region.put_bytes(cursor + 4, source_bytes);

        self.region
            .atomic_i64(offset + OBSERVATION_COUNT_OFFSET)
            .store(1, Ordering::Release);

        self.next_offset += aligned;
        Some(LossEntry { offset })
    }

    /// Record further loss against an existing entry.
    pub fn record_observation(&self, entry: LossEntry, bytes_lost: i64, now_ms: i64) {
        self.region
            .atomic_i64(entry.offset + TOTAL_BYTES_OFFSET)
            .fetch_add(bytes_lost, Ordering::Relaxed);
        self.region
            .atomic_i64(entry.offset + LAST_OBSERVATION_OFFSET)
            .store(now_ms, Ordering::Relaxed);
        self.region
            .atomic_i64(entry.offset + OBSERVATION_COUNT_OFFSET)
            .fetch_add(1, Ordering::Release);
    }
}

/// One decoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossReportEntry {
    pub observation_count: i64,
    pub total_bytes_lost: i64,
    pub first_observation_ms: i64,
    pub last_observation_ms: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub source: String,
}

/// Visit all entries; returns how many were visited.
pub fn read_loss_report(region: Region, mut handler: impl FnMut(&LossReportEntry)) -> usize {
    let mut offset = 0;
    let mut visited = 0;

    while offset + CHANNEL_LENGTH_OFFSET + 8 <= region.len() {
        let observation_count = region
            .atomic_i64(offset + OBSERVATION_COUNT_OFFSET)
            .load(Ordering::Acquire);
        if observation_count <= 0 {
            break;
        }

        let mut int_bytes = [0u8; 4];
        region.get_bytes(offset + SESSION_ID_OFFSET, &mut int_bytes);
        let session_id = i32::from_le_bytes(int_bytes);
        region.get_bytes(offset + STREAM_ID_OFFSET, &mut int_bytes);
        let stream_id = i32::from_le_bytes(int_bytes);

        region.get_bytes(offset + CHANNEL_LENGTH_OFFSET, &mut int_bytes);
        let channel_length = i32::from_le_bytes(int_bytes).max(0) as usize;
        let mut channel = vec![0u8; channel_length];
        region.get_bytes(offset + CHANNEL_LENGTH_OFFSET + 4, &mut channel);

        let source_length_offset = offset + CHANNEL_LENGTH_OFFSET + 4 + channel_length;
        region.get_bytes(source_length_offset, &mut int_bytes);
        let source_length = i32::from_le_bytes(int_bytes).max(0) as usize;
        let mut source = vec![0u8; source_length];
        region.get_bytes(source_length_offset + 4, &mut source);

        handler(&LossReportEntry {
            observation_count,
            total_bytes_lost: region
                .atomic_i64(offset + TOTAL_BYTES_OFFSET)
                .load(Ordering::Acquire),
            first_observation_ms: region
                .atomic_i64(offset + FIRST_OBSERVATION_OFFSET)
                .load(Ordering::Acquire),
            last_observation_ms: region
                .atomic_i64(offset + LAST_OBSERVATION_OFFSET)
                .load(Ordering::Acquire),
            session_id,
            stream_id,
            channel: String::from_utf8_lossy(&channel).into_owned(),
            source: String::from_utf8_lossy(&source).into_owned(),
        });
        visited += 1;

        let length = CHANNEL_LENGTH_OFFSET + 4 + channel_length + 4 + source_length;
        offset += align(length, ENTRY_ALIGNMENT);
    }

    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use spate_primitives::region::HeapRegion;

    #[test]
    fn entry_roundtrip_with_updates() {
        let heap = HeapRegion::new_zeroed(1024);
        let mut reporter = LossReporter::new(heap.region());

        let entry = reporter
            .create_entry(128, 1000, 7, 9, "spate:udp?endpoint=127.0.0.1:9000", "127.0.0.1:54321")
            .unwrap();
        reporter.record_observation(entry, 64, 2000);

        let mut entries = Vec::new();
        let visited = read_loss_report(heap.region(), |e| entries.push(e.clone()));
        assert_eq!(visited, 1);
        assert_eq!(entries[0].observation_count, 2);
        assert_eq!(entries[0].total_bytes_lost, 192);
        assert_eq!(entries[0].first_observation_ms, 1000);
        assert_eq!(entries[0].last_observation_ms, 2000);
        assert_eq!(entries[0].session_id, 7);
        assert_eq!(entries[0].channel, "spate:udp?endpoint=127.0.0.1:9000");
    }

    #[test]
    fn full_report_returns_none() {
        let heap = HeapRegion::new_zeroed(64);
        let mut reporter = LossReporter::new(heap.region());
        assert!(reporter
            .create_entry(1, 0, 1, 1, "a-very-long-channel-uri-that-will-not-fit", "src")
            .is_none());
    }
}
