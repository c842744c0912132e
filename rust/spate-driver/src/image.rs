//! Publication images: the receiver-side mirror of a remote publication.

use std::net::SocketAddr;
use std::sync::Arc;

use spate_logbuffer::gap_scanner::Gap;
use spate_logbuffer::layout::{self, LogBuffers};
use spate_logbuffer::position::{
    compute_position, compute_term_id_from_position, compute_term_offset_from_position,
};
use spate_logbuffer::{gap_filler, rebuilder};
use spate_primitives::counters::AtomicCounter;
use spate_primitives::sync::{AtomicI64, AtomicU32, Ordering};
use spate_proto::{DataHeader, DATA_EOS_FLAG};

use crate::congestion_control::CongestionControl;
use crate::loss_detector::LossDetector;
use crate::loss_report::{LossEntry, LossReporter};

/// Lifecycle of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ImageState {
    Init = 0,
    Active = 1,
    /// Subscribers are catching up to the final position.
    Draining = 2,
    Linger = 3,
    Closed = 4,
}

impl ImageState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => ImageState::Init,
            1 => ImageState::Active,
            2 => ImageState::Draining,
            3 => ImageState::Linger,
            _ => ImageState::Closed,
        }
    }
}

/// Cross-thread state of one image.
pub struct ImageShared {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub position_bits_to_shift: u32,
    pub term_length: usize,
    pub mtu_length: usize,
    pub channel: String,
    pub source_identity: String,
    pub log: LogBuffers,
    /// Highest position any byte has been received for.
    pub hwm_position: AtomicCounter,
    /// Contiguously rebuilt position.
    pub rebuild_position: AtomicCounter,
    pub subscriber_positions: Vec<AtomicCounter>,
    state: AtomicU32,
    pub time_of_last_packet_ns: AtomicI64,
    /// `i64::MAX` until end-of-stream is known.
    pub end_of_stream_position: AtomicI64,
}

impl ImageShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        correlation_id: i64,
        session_id: i32,
        stream_id: i32,
        channel: String,
        source_identity: String,
        log: LogBuffers,
        hwm_position: AtomicCounter,
        rebuild_position: AtomicCounter,
        subscriber_positions: Vec<AtomicCounter>,
    ) -> Self {
        let term_length = log.term_length();
        Self {
            correlation_id,
            session_id,
            stream_id,
            initial_term_id: log.initial_term_id(),
            position_bits_to_shift: spate_logbuffer::position::position_bits_to_shift(term_length),
            term_length,
            mtu_length: log.mtu_length(),
            channel,
            source_identity,
            log,
            hwm_position,
            rebuild_position,
            subscriber_positions,
            state: AtomicU32::new(ImageState::Init as u32),
            time_of_last_packet_ns: AtomicI64::new(0),
            end_of_stream_position: AtomicI64::new(i64::MAX),
        }
    }

    pub fn state(&self) -> ImageState {
        ImageState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ImageState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn min_subscriber_position(&self) -> i64 {
        self.subscriber_positions
            .iter()
            .map(|p| p.get())
            .min()
            .unwrap_or(0)
    }

    pub fn end_of_stream_reached(&self) -> bool {
        let eos = self.end_of_stream_position.load(Ordering::Acquire);
        eos != i64::MAX && self.min_subscriber_position() >= eos
    }
}

/// Receiver-owned hot state of one image.
pub struct PublicationImage {
    pub shared: Arc<ImageShared>,
    pub endpoint_id: i64,
    /// Where status messages and NAKs are sent.
    pub control_address: SocketAddr,
    pub receiver_id: i64,
    pub reliable: bool,
    pub congestion_control: Box<dyn CongestionControl>,
    pub loss_detector: LossDetector,
    /// Local mirrors of the shared counters.
    rebuild_position: i64,
    hwm_position: i64,
    /// Highest term count whose partition has been zeroed for reuse.
    highest_prepared_term_count: i32,
    pub last_sm_position: i64,
    pub last_sm_window: i32,
    pub last_sm_time_ns: i64,
    /// Force an SM on the next opportunity (window change, first contact).
    pub force_status_message: bool,
    pub loss_entry: Option<LossEntry>,
    /// Bytes of loss newly observed, awaiting a report entry.
    pub loss_since_last_report: i64,
}

/// Result of offering a data packet to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDataOutcome {
    /// Frame bytes accepted (count included).
    Inserted(usize),
    /// Heartbeat processed.
    Heartbeat,
    /// Out of the receiver window; dropped and counted by the caller.
    WindowOverrun,
}

impl PublicationImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<ImageShared>,
        endpoint_id: i64,
        control_address: SocketAddr,
        receiver_id: i64,
        reliable: bool,
        congestion_control: Box<dyn CongestionControl>,
        loss_detector: LossDetector,
        join_position: i64,
    ) -> Self {
        let initial_window = congestion_control.initial_window_length();
        shared.rebuild_position.set(join_position);
        shared.hwm_position.set(join_position);
        for position in &shared.subscriber_positions {
            position.set(join_position);
        }
        let join_term_count = (join_position >> shared.position_bits_to_shift) as i32;
        Self {
            shared,
            endpoint_id,
            control_address,
            receiver_id,
            reliable,
            congestion_control,
            loss_detector,
            rebuild_position: join_position,
            hwm_position: join_position,
            highest_prepared_term_count: join_term_count,
            last_sm_position: join_position,
            last_sm_window: initial_window,
            last_sm_time_ns: 0,
            force_status_message: true,
            loss_entry: None,
            loss_since_last_report: 0,
        }
    }

    pub fn rebuild_position(&self) -> i64 {
        self.rebuild_position
    }

    pub fn hwm_position(&self) -> i64 {
        self.hwm_position
    }

    /// Apply an arriving DATA/PAD frame (or heartbeat).
    pub fn on_data(&mut self, header: &DataHeader, packet: &[u8], now_ns: i64) -> OnDataOutcome {
        self.shared
            .time_of_last_packet_ns
            .store(now_ns, Ordering::Release);

        let position = compute_position(
            header.term_id,
            header.term_offset,
            self.shared.position_bits_to_shift,
            self.shared.initial_term_id,
        );

        if header.frame_length == 0 {
            // Heartbeat: keeps the image alive and, with the EOS flag,
            // communicates the final position.
            if header.flags & DATA_EOS_FLAG != 0 {
                self.shared
                    .end_of_stream_position
                    .store(position, Ordering::Release);
                // Mirror into the log metadata so subscribers mapping the
                // log observe end-of-stream too.
                self.shared.log.meta().signal_end_of_stream(position);
            }
            self.hwm_position = self.hwm_position.max(position);
            self.shared.hwm_position.propose_max(self.hwm_position);
            return OnDataOutcome::Heartbeat;
        }

        let window = self.last_sm_window as i64;
        if position < self.rebuild_position.saturating_sub(self.shared.term_length as i64)
            || position + packet.len() as i64 > self.rebuild_position + window.max(self.shared.mtu_length as i64)
        {
            return OnDataOutcome::WindowOverrun;
        }

        let term_count = header.term_id.wrapping_sub(self.shared.initial_term_id);
        self.prepare_terms_up_to(term_count);
        let term = self.shared.log.term(layout::index_by_term_count(term_count));
        rebuilder::insert(term, header.term_offset as usize, packet);

        let end_position = position + layout::align_frame_length(packet.len()) as i64;
        self.hwm_position = self.hwm_position.max(end_position);
        self.shared.hwm_position.propose_max(self.hwm_position);
        self.update_rebuild_position();

        OnDataOutcome::Inserted(packet.len())
    }

    /// Zero partitions being entered for the first time so stale frames
    /// from three terms ago cannot read as committed.
    fn prepare_terms_up_to(&mut self, term_count: i32) {
        while self.highest_prepared_term_count < term_count {
            let next = self.highest_prepared_term_count + 1;
            let term = self.shared.log.term(layout::index_by_term_count(next));
            term.set_zero(0, term.len());
            self.highest_prepared_term_count = next;
        }
    }

    /// Advance the rebuild position over contiguously committed frames.
    fn update_rebuild_position(&mut self) {
        let bits = self.shared.position_bits_to_shift;
        let term_length = self.shared.term_length as i64;

        loop {
            let term_id =
                compute_term_id_from_position(self.rebuild_position, bits, self.shared.initial_term_id);
            let term_count = term_id.wrapping_sub(self.shared.initial_term_id);
            let offset = compute_term_offset_from_position(self.rebuild_position, bits) as i64;
            let term_begin = self.rebuild_position - offset;

            let limit = (self.hwm_position - term_begin).min(term_length);
            if limit <= offset {
                break;
            }

            let term = self.shared.log.term(layout::index_by_term_count(term_count));
            match spate_logbuffer::gap_scanner::scan_for_gap(
                term,
                term_id,
                offset as usize,
                limit as usize,
            ) {
                Some(gap) => {
                    self.rebuild_position = term_begin + gap.term_offset as i64;
                    break;
                }
                None => {
                    self.rebuild_position = term_begin + limit;
                    if limit < term_length {
                        break;
                    }
                }
            }
        }

        self.shared.rebuild_position.propose_max(self.rebuild_position);
    }

    /// Whether a status message is due, and the fields to send.
    ///
    /// Returns `(consumption_term_id, consumption_term_offset, window)`.
    pub fn status_message_if_due(
        &mut self,
        now_ns: i64,
        sm_timeout_ns: i64,
    ) -> Option<(i32, i32, i32)> {
        // Track rebuild through congestion control each pass.
        let loss = self.loss_since_last_report > 0;
        self.loss_since_last_report = 0;
        let (window, force) = self.congestion_control.on_track_rebuild(
            now_ns,
            self.rebuild_position,
            self.hwm_position,
            loss,
        );

        let threshold = (window / 4) as i64;
        let due = self.force_status_message
            || force
            || self.rebuild_position - self.last_sm_position >= threshold
            || now_ns - self.last_sm_time_ns >= sm_timeout_ns;
        if !due {
            return None;
        }

        self.force_status_message = false;
        self.last_sm_position = self.rebuild_position;
        self.last_sm_window = window;
        self.last_sm_time_ns = now_ns;

        let bits = self.shared.position_bits_to_shift;
        Some((
            compute_term_id_from_position(self.rebuild_position, bits, self.shared.initial_term_id),
            compute_term_offset_from_position(self.rebuild_position, bits),
            window,
        ))
    }

    /// Run the loss detector; NAK ranges surface through `on_nak`.
    pub fn detect_loss(&mut self, now_ns: i64, mut on_nak: impl FnMut(&Gap)) -> usize {
        if self.shared.state() != ImageState::Active {
            return 0;
        }
        let bits = self.shared.position_bits_to_shift;
        let term_id =
            compute_term_id_from_position(self.rebuild_position, bits, self.shared.initial_term_id);
        let term_count = term_id.wrapping_sub(self.shared.initial_term_id);
        let offset = compute_term_offset_from_position(self.rebuild_position, bits) as i64;
        let term_begin = self.rebuild_position - offset;
        let limit = (self.hwm_position - term_begin).min(self.shared.term_length as i64);
        if limit <= offset {
            return 0;
        }

        let term = self.shared.log.term(layout::index_by_term_count(term_count));
        let emitted = self.loss_detector.scan(
            term,
            term_id,
            offset as usize,
            limit as usize,
            now_ns,
            |gap| {
                on_nak(gap);
            },
        );
        self.loss_since_last_report += emitted as i64;
        emitted
    }

    /// Give up on a gap (unreliable stream): pad over it and advance.
    pub fn fill_gap(&mut self, reporter: &mut LossReporter, gap: &Gap, now_ms: i64) {
        let term_count = gap.term_id.wrapping_sub(self.shared.initial_term_id);
        let term = self.shared.log.term(layout::index_by_term_count(term_count));
        gap_filler::fill_gap(term, self.shared.session_id, self.shared.stream_id, gap);

        match self.loss_entry {
            Some(entry) => reporter.record_observation(entry, gap.length as i64, now_ms),
            None => {
                self.loss_entry = reporter.create_entry(
                    gap.length as i64,
                    now_ms,
                    self.shared.session_id,
                    self.shared.stream_id,
                    &self.shared.channel,
                    &self.shared.source_identity,
                );
            }
        }

        self.update_rebuild_position();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion_control::StaticWindowCongestionControl;
    use crate::loss_detector::FeedbackDelayGenerator;
    use spate_primitives::counters::{CountersManager, COUNTER_LENGTH, METADATA_LENGTH};
    use spate_primitives::region::HeapRegion;
    use spate_proto::{frame_type, DATA_HEADER_LENGTH, UNFRAGMENTED};

    struct Fixture {
        _metadata: HeapRegion,
        _values: HeapRegion,
        image: PublicationImage,
    }

    fn fixture() -> Fixture {
        let metadata = HeapRegion::new_zeroed(METADATA_LENGTH * 16);
        let values = HeapRegion::new_zeroed(COUNTER_LENGTH * 16);
        let mut manager = CountersManager::new(metadata.region(), values.region(), 0);

        let hwm = manager.allocate(5, &[], "rcv-hwm", 0).unwrap();
        let rebuild = manager.allocate(6, &[], "rcv-pos", 0).unwrap();
        let sub = manager.allocate(4, &[], "sub-pos", 0).unwrap();

        let log = LogBuffers::heap(64 * 1024, 0, 1408, 1, 10);
        let shared = Arc::new(ImageShared::new(
            100,
            1,
            10,
            "spate:udp?endpoint=127.0.0.1:9000".to_string(),
            "127.0.0.1:5555".to_string(),
            log,
            hwm,
            rebuild,
            vec![sub],
        ));
        shared.set_state(ImageState::Active);

        let image = PublicationImage::new(
            shared,
            1,
            "127.0.0.1:5555".parse().unwrap(),
            77,
            true,
            Box::new(StaticWindowCongestionControl::new(32 * 1024)),
            LossDetector::new(FeedbackDelayGenerator::Static { delay_ns: 0 }, 1_000_000),
            0,
        );
        Fixture { _metadata: metadata, _values: values, image }
    }

    fn data_packet(term_id: i32, term_offset: i32, payload_len: usize) -> (DataHeader, Vec<u8>) {
        let header = DataHeader {
            frame_length: (DATA_HEADER_LENGTH + payload_len) as i32,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset,
            session_id: 1,
            stream_id: 10,
            term_id,
            reserved_value: 0,
        };
        let mut packet = vec![0u8; DATA_HEADER_LENGTH + payload_len];
        header.encode(&mut packet);
        (header, packet)
    }

    #[test]
    fn in_order_data_advances_rebuild_and_hwm() {
        let mut fx = fixture();
        let (h1, p1) = data_packet(0, 0, 96); // 128-byte frame
        let (h2, p2) = data_packet(0, 128, 96);

        assert_eq!(fx.image.on_data(&h1, &p1, 10), OnDataOutcome::Inserted(128));
        assert_eq!(fx.image.rebuild_position(), 128);

        fx.image.on_data(&h2, &p2, 20);
        assert_eq!(fx.image.rebuild_position(), 256);
        assert_eq!(fx.image.hwm_position(), 256);
        assert_eq!(fx.image.shared.rebuild_position.get(), 256);
    }

    #[test]
    fn out_of_order_data_holds_rebuild_at_gap() {
        let mut fx = fixture();
        let (h2, p2) = data_packet(0, 128, 96);
        fx.image.on_data(&h2, &p2, 10);

        assert_eq!(fx.image.rebuild_position(), 0);
        assert_eq!(fx.image.hwm_position(), 256);

        let (h1, p1) = data_packet(0, 0, 96);
        fx.image.on_data(&h1, &p1, 20);
        assert_eq!(fx.image.rebuild_position(), 256);
    }

    #[test]
    fn loss_detector_naks_the_gap() {
        let mut fx = fixture();
        let (h2, p2) = data_packet(0, 128, 96);
        fx.image.on_data(&h2, &p2, 10);

        let mut naks = Vec::new();
        fx.image.detect_loss(1_000, |gap| naks.push(*gap));
        assert_eq!(naks.len(), 1);
        assert_eq!(naks[0].term_offset, 0);
        assert_eq!(naks[0].length, 128);
    }

    #[test]
    fn heartbeat_with_eos_sets_final_position() {
        let mut fx = fixture();
        let heartbeat = DataHeader {
            frame_length: 0,
            flags: UNFRAGMENTED | DATA_EOS_FLAG,
            frame_type: frame_type::DATA,
            term_offset: 256,
            session_id: 1,
            stream_id: 10,
            term_id: 0,
            reserved_value: 0,
        };
        let mut packet = vec![0u8; DATA_HEADER_LENGTH];
        heartbeat.encode(&mut packet);

        assert_eq!(fx.image.on_data(&heartbeat, &packet, 10), OnDataOutcome::Heartbeat);
        assert_eq!(
            fx.image.shared.end_of_stream_position.load(Ordering::Relaxed),
            256
        );
    }

    #[test]
    fn status_message_due_on_timeout_and_progress() {
        let mut fx = fixture();
        // Forced at start.
        assert!(fx.image.status_message_if_due(0, 1_000_000).is_some());
        // Nothing new shortly after.
        assert!(fx.image.status_message_if_due(100, 1_000_000).is_none());
        // Due again on timeout.
        assert!(fx.image.status_message_if_due(2_000_000, 1_000_000).is_some());

        // Due on a window's quarter of progress.
        let mut offset = 0;
        while offset < 10 * 1024 {
            let (h, p) = data_packet(0, offset, 992);
            fx.image.on_data(&h, &p, 2_000_100);
            offset += 1024;
        }
        assert!(fx.image.status_message_if_due(2_000_200, 1_000_000).is_some());
    }

    #[test]
    fn gap_fill_unblocks_unreliable_stream() {
        let mut fx = fixture();
        let report = HeapRegion::new_zeroed(4096);
        let mut reporter = LossReporter::new(report.region());

        let (h2, p2) = data_packet(0, 128, 96);
        fx.image.on_data(&h2, &p2, 10);
        assert_eq!(fx.image.rebuild_position(), 0);

        let gap = Gap { term_id: 0, term_offset: 0, length: 128 };
        fx.image.fill_gap(&mut reporter, &gap, 1000);
        assert_eq!(fx.image.rebuild_position(), 256);

        let mut entries = 0;
        crate::loss_report::read_loss_report(report.region(), |_| entries += 1);
        assert_eq!(entries, 1);
    }
}
