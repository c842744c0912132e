//! Publication state.
//!
//! Split along the ownership line the agents need:
//!
//! - [`PublicationShared`] is the `Arc`'d cross-thread part: identity,
//!   the log buffers, position counters and the lifecycle state word. The
//!   conductor drives the state machine; the sender reads it.
//! - [`NetworkPublication`] is sender-owned hot state: flow control,
//!   retransmit handler, pacing timers. It travels Conductor → Sender over
//!   the proxy queue at creation and is dropped by the sender on removal.
//! - [`IpcPublication`] never reaches the sender; the conductor manages
//!   its consumer-driven position limit directly.

use std::sync::Arc;

use spate_logbuffer::layout::{self, LogBuffers};
use spate_logbuffer::position::{
    compute_position, compute_term_id_from_position, compute_term_offset_from_position,
};
use spate_logbuffer::scanner;
use spate_primitives::counters::AtomicCounter;
use spate_primitives::sync::{AtomicI64, AtomicU32, Ordering};

use crate::flow_control::FlowControl;
use crate::retransmit::RetransmitHandler;

/// Lifecycle of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PublicationState {
    Active = 0,
    /// Unreferenced; producers are observing the frozen limit.
    Draining = 1,
    /// Kept so late subscribers can observe end-of-stream.
    Linger = 2,
    Closed = 3,
}

impl PublicationState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => PublicationState::Active,
            1 => PublicationState::Draining,
            2 => PublicationState::Linger,
            _ => PublicationState::Closed,
        }
    }
}

/// Cross-thread state of one publication.
pub struct PublicationShared {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub position_bits_to_shift: u32,
    pub term_length: usize,
    pub term_window_length: usize,
    pub mtu_length: usize,
    pub channel: String,
    pub log: LogBuffers,
    /// Limit producers claim against.
    pub publisher_limit: AtomicCounter,
    /// Position the sender has transmitted up to.
    pub sender_position: AtomicCounter,
    /// Position limit the sender currently honours.
    pub sender_limit: AtomicCounter,
    state: AtomicU32,
    /// Last send or received-SM time, for conductor liveness checks.
    pub time_of_last_activity_ns: AtomicI64,
}

impl PublicationShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        channel: String,
        log: LogBuffers,
        term_window_length: usize,
        publisher_limit: AtomicCounter,
        sender_position: AtomicCounter,
        sender_limit: AtomicCounter,
    ) -> Self {
        let term_length = log.term_length();
        let initial_term_id = log.initial_term_id();
        let mtu_length = log.mtu_length();
        Self {
            registration_id,
            session_id,
            stream_id,
            initial_term_id,
            position_bits_to_shift: spate_logbuffer::position::position_bits_to_shift(term_length),
            term_length,
            term_window_length,
            mtu_length,
            channel,
            log,
            publisher_limit,
            sender_position,
            sender_limit,
            state: AtomicU32::new(PublicationState::Active as u32),
            time_of_last_activity_ns: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> PublicationState {
        PublicationState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: PublicationState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Position the producers have claimed up to.
    pub fn producer_position(&self) -> i64 {
        let meta = self.log.meta();
        let term_count = meta.active_term_count();
        let raw_tail = meta.tail_counters[layout::index_by_term_count(term_count)]
            .load(Ordering::Acquire);
        compute_position(
            layout::term_id(raw_tail),
            layout::term_offset(raw_tail, self.term_length),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }
}

/// Sender-owned per-publication state.
pub struct NetworkPublication {
    pub shared: Arc<PublicationShared>,
    /// The send channel endpoint this publication multiplexes onto.
    pub endpoint_id: i64,
    pub flow_control: Box<dyn FlowControl>,
    pub retransmit: RetransmitHandler,
    /// Local mirror of the sender position counter.
    pub sender_position: i64,
    pub position_limit: i64,
    pub time_of_last_send_ns: i64,
    pub time_of_last_setup_ns: i64,
    /// Send a SETUP on the next duty cycle (solicited or initial).
    pub should_send_setup: bool,
    /// True once any status message has arrived.
    pub has_seen_status_message: bool,
}

impl NetworkPublication {
    pub fn new(
        shared: Arc<PublicationShared>,
        endpoint_id: i64,
        flow_control: Box<dyn FlowControl>,
        retransmit: RetransmitHandler,
    ) -> Self {
        let position_limit = flow_control.initial_position_limit();
        Self {
            shared,
            endpoint_id,
            flow_control,
            retransmit,
            sender_position: 0,
            position_limit,
            time_of_last_send_ns: 0,
            time_of_last_setup_ns: 0,
            should_send_setup: true,
            has_seen_status_message: false,
        }
    }

    /// Term id at the current sender position.
    pub fn active_term_id(&self) -> i32 {
        compute_term_id_from_position(
            self.sender_position,
            self.shared.position_bits_to_shift,
            self.shared.initial_term_id,
        )
    }

    /// Offset within the active term at the current sender position.
    pub fn term_offset(&self) -> i32 {
        compute_term_offset_from_position(self.sender_position, self.shared.position_bits_to_shift)
    }

    /// Scan the active term for bytes to transmit, bounded by the flow
    /// control limit and one MTU batch.
    pub fn scan_for_send(&self) -> (spate_primitives::region::Region, usize, scanner::ScanOutcome) {
        let term_id = self.active_term_id();
        let term_count = term_id.wrapping_sub(self.shared.initial_term_id);
        let term = self.shared.log.term(layout::index_by_term_count(term_count));
        let offset = self.term_offset() as usize;

        let window = (self.position_limit - self.sender_position).max(0) as usize;
        let max_length = window.min(self.shared.mtu_length);
        let outcome = scanner::scan_for_availability(term, offset, max_length);
        (term, offset, outcome)
    }
}

/// Conductor-owned IPC publication.
///
/// No sender involvement: subscribers read the publication's own log, so
/// the "position limit" is the minimum subscriber position plus the term
/// window.
pub struct IpcPublication {
    pub shared: Arc<PublicationShared>,
    pub subscriber_positions: Vec<AtomicCounter>,
}

impl IpcPublication {
    pub fn new(shared: Arc<PublicationShared>) -> Self {
        Self { shared, subscriber_positions: Vec::new() }
    }

    /// Recompute and publish the producer limit; returns it.
    pub fn update_publisher_limit(&self) -> i64 {
        let consumed = self
            .subscriber_positions
            .iter()
            .map(|p| p.get())
            .min()
            .unwrap_or_else(|| self.shared.producer_position());
        let limit = consumed + self.shared.term_window_length as i64;
        self.shared.publisher_limit.propose_max(limit);
        limit
    }

    /// Minimum consumed position across subscribers.
    pub fn min_subscriber_position(&self) -> Option<i64> {
        self.subscriber_positions.iter().map(|p| p.get()).min()
    }
}
