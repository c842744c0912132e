//! Driver-wide system counters, allocated once at startup in a fixed order
//! so tools can address them by id.

use spate_primitives::counters::{AtomicCounter, CountersManager};

/// Counter type ids stored in counter metadata.
pub mod counter_type {
    pub const SYSTEM: i32 = 0;
    pub const PUBLISHER_LIMIT: i32 = 1;
    pub const SENDER_POSITION: i32 = 2;
    pub const SENDER_LIMIT: i32 = 3;
    pub const SUBSCRIBER_POSITION: i32 = 4;
    pub const RECEIVER_HWM: i32 = 5;
    pub const RECEIVER_POSITION: i32 = 6;
    pub const CLIENT_HEARTBEAT: i32 = 7;
}

/// Stable ids of the system counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SystemCounterId {
    BytesSent = 0,
    BytesReceived,
    NaksSent,
    NaksReceived,
    RetransmitsSent,
    StatusMessagesSent,
    StatusMessagesReceived,
    HeartbeatsSent,
    HeartbeatsReceived,
    Errors,
    ClientCommands,
    BackPressureEvents,
    UnblockedPublications,
    FlowControlUnderRuns,
    FlowControlOverRuns,
    InvalidPackets,
    ClientTimeouts,
    ShortSends,
    RetransmitOverflows,
    LossGapFills,
    ImagesCreated,
    ImagesClosed,
}

const LABELS: &[(&str, SystemCounterId)] = &[
    ("Bytes sent", SystemCounterId::BytesSent),
    ("Bytes received", SystemCounterId::BytesReceived),
    ("NAKs sent", SystemCounterId::NaksSent),
    ("NAKs received", SystemCounterId::NaksReceived),
    ("Retransmits sent", SystemCounterId::RetransmitsSent),
    ("Status messages sent", SystemCounterId::StatusMessagesSent),
    ("Status messages received", SystemCounterId::StatusMessagesReceived),
    ("Heartbeats sent", SystemCounterId::HeartbeatsSent),
    ("Heartbeats received", SystemCounterId::HeartbeatsReceived),
    ("Errors", SystemCounterId::Errors),
    ("Client commands", SystemCounterId::ClientCommands),
    ("Back-pressure events", SystemCounterId::BackPressureEvents),
    ("Unblocked publications", SystemCounterId::UnblockedPublications),
    ("Flow control under-runs", SystemCounterId::FlowControlUnderRuns),
    ("Flow control over-runs", SystemCounterId::FlowControlOverRuns),
    ("Invalid packets", SystemCounterId::InvalidPackets),
    ("Client timeouts", SystemCounterId::ClientTimeouts),
    ("Short sends", SystemCounterId::ShortSends),
    ("Retransmit overflows", SystemCounterId::RetransmitOverflows),
    ("Loss gap fills", SystemCounterId::LossGapFills),
    ("Images created", SystemCounterId::ImagesCreated),
    ("Images closed", SystemCounterId::ImagesClosed),
];

/// Handles to all system counters.
pub struct SystemCounters {
    counters: Vec<AtomicCounter>,
}

impl SystemCounters {
    pub fn new(manager: &mut CountersManager, now_ms: i64) -> Result<Self, &'static str> {
        let mut counters = Vec::with_capacity(LABELS.len());
        for (index, (label, id)) in LABELS.iter().enumerate() {
            debug_assert_eq!(index, *id as usize);
            counters.push(manager.allocate(counter_type::SYSTEM, &[], label, now_ms)?);
        }
        Ok(Self { counters })
    }

    #[inline]
    pub fn get(&self, id: SystemCounterId) -> AtomicCounter {
        self.counters[id as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spate_primitives::counters::{CountersReader, COUNTER_LENGTH, METADATA_LENGTH};
    use spate_primitives::region::HeapRegion;

    #[test]
    fn allocation_order_matches_ids() {
        let metadata = HeapRegion::new_zeroed(METADATA_LENGTH * 64);
        let values = HeapRegion::new_zeroed(COUNTER_LENGTH * 64);
        let mut manager = CountersManager::new(metadata.region(), values.region(), 0);

        let counters = SystemCounters::new(&mut manager, 0).unwrap();
        counters.get(SystemCounterId::NaksSent).increment();

        let reader = CountersReader::new(metadata.region(), values.region());
        assert_eq!(reader.counter_value(SystemCounterId::NaksSent as i32), 1);

        let mut labels = Vec::new();
        reader.for_each(|id, _, _, label| labels.push((id, label.to_string())));
        assert_eq!(labels[2], (2, "NAKs sent".to_string()));
    }
}
