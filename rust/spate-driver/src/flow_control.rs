//! Sender-side flow control strategies.
//!
//! A strategy consumes status messages and yields the **position limit**:
//! the stream position beyond which the sender must not transmit. Selected
//! per publication at creation time and owned by the sender thread.

use std::net::SocketAddr;

use spate_logbuffer::position::compute_position;
use spate_proto::StatusMessageHeader;

/// The capability set the sender drives.
pub trait FlowControl: Send {
    /// Apply a status message; returns the new position limit.
    fn on_status_message(
        &mut self,
        sm: &StatusMessageHeader,
        src: SocketAddr,
        initial_term_id: i32,
        position_bits_to_shift: u32,
        now_ns: i64,
    ) -> i64;

    /// Periodic pass: evict silent receivers. `fallback_limit` is
    /// `sender_position + term_window`, used by optimistic multicast when
    /// the receiver set is empty. Returns the current position limit.
    fn on_idle(&mut self, now_ns: i64, fallback_limit: i64) -> i64;

    /// False while a required receiver group has not yet formed.
    fn has_required_receivers(&self) -> bool;

    /// Limit before any status message has been seen.
    fn initial_position_limit(&self) -> i64 {
        0
    }
}

/// Unicast: single receiver, limit advances monotonically with its
/// consumption position plus window.
pub struct UnicastFlowControl {
    position_limit: i64,
}

impl UnicastFlowControl {
    pub fn new() -> Self {
        Self { position_limit: 0 }
    }
}

impl Default for UnicastFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl for UnicastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessageHeader,
        _src: SocketAddr,
        initial_term_id: i32,
        position_bits_to_shift: u32,
        _now_ns: i64,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            position_bits_to_shift,
            initial_term_id,
        );
        self.position_limit = self
            .position_limit
            .max(position + sm.receiver_window as i64);
        self.position_limit
    }

    fn on_idle(&mut self, _now_ns: i64, _fallback_limit: i64) -> i64 {
        self.position_limit
    }

    fn has_required_receivers(&self) -> bool {
        true
    }
}

struct TrackedReceiver {
    receiver_id: i64,
    limit: i64,
    last_sm_ns: i64,
}

/// Multicast: limit is the minimum over all live receivers.
///
/// `group_size == 0` is the optimistic variant: with no receivers the
/// limit relaxes to the fallback so a publisher is never blocked by an
/// empty group. A non-zero `group_size` withholds data until that many
/// receivers are present.
pub struct MinMulticastFlowControl {
    receivers: Vec<TrackedReceiver>,
    receiver_timeout_ns: i64,
    group_size: usize,
    position_limit: i64,
}

impl MinMulticastFlowControl {
    pub fn new(receiver_timeout_ns: i64, group_size: usize) -> Self {
        Self {
            receivers: Vec::new(),
            receiver_timeout_ns,
            group_size,
            position_limit: 0,
        }
    }

    fn min_limit(&self) -> Option<i64> {
        self.receivers.iter().map(|r| r.limit).min()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }
}

impl FlowControl for MinMulticastFlowControl {
    fn on_status_message(
        &mut self,
        sm: &StatusMessageHeader,
        _src: SocketAddr,
        initial_term_id: i32,
        position_bits_to_shift: u32,
        now_ns: i64,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            position_bits_to_shift,
            initial_term_id,
        );
        let limit = position + sm.receiver_window as i64;

        match self
            .receivers
            .iter_mut()
            .find(|r| r.receiver_id == sm.receiver_id)
        {
            Some(receiver) => {
                receiver.limit = limit;
                receiver.last_sm_ns = now_ns;
            }
            None => self.receivers.push(TrackedReceiver {
                receiver_id: sm.receiver_id,
                limit,
                last_sm_ns: now_ns,
            }),
        }

        if self.has_required_receivers() {
            if let Some(min) = self.min_limit() {
                self.position_limit = min;
            }
        }
        self.position_limit
    }

    fn on_idle(&mut self, now_ns: i64, fallback_limit: i64) -> i64 {
        let timeout = self.receiver_timeout_ns;
        self.receivers.retain(|r| now_ns - r.last_sm_ns <= timeout);

        match self.min_limit() {
            Some(min) if self.has_required_receivers() => self.position_limit = min,
            Some(_) => {}
            None if self.group_size == 0 => {
                self.position_limit = self.position_limit.max(fallback_limit);
            }
            None => {}
        }
        self.position_limit
    }

    fn has_required_receivers(&self) -> bool {
        self.receivers.len() >= self.group_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sm(receiver_id: i64, term_id: i32, offset: i32, window: i32) -> StatusMessageHeader {
        StatusMessageHeader {
            flags: 0,
            session_id: 1,
            stream_id: 1,
            consumption_term_id: term_id,
            consumption_term_offset: offset,
            receiver_window: window,
            receiver_id,
        }
    }

    fn src() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    const BITS: u32 = 16; // 64 KiB terms

    #[test]
    fn unicast_limit_is_monotone() {
        let mut fc = UnicastFlowControl::new();
        assert_eq!(fc.initial_position_limit(), 0);

        let limit = fc.on_status_message(&sm(1, 0, 1024, 4096), src(), 0, BITS, 0);
        assert_eq!(limit, 1024 + 4096);

        // A reordered, older SM cannot retreat the limit.
        let limit = fc.on_status_message(&sm(1, 0, 512, 4096), src(), 0, BITS, 0);
        assert_eq!(limit, 1024 + 4096);

        let limit = fc.on_status_message(&sm(1, 1, 0, 4096), src(), 0, BITS, 0);
        assert_eq!(limit, 64 * 1024 + 4096);
    }

    #[test]
    fn multicast_min_takes_slowest_receiver() {
        let mut fc = MinMulticastFlowControl::new(1_000_000, 0);
        fc.on_status_message(&sm(1, 0, 64 * 1024 - 1024, 64 * 1024), src(), 0, BITS, 0);
        let limit = fc.on_status_message(&sm(2, 0, 1024, 32 * 1024), src(), 0, BITS, 0);
        assert_eq!(limit, 1024 + 32 * 1024);
    }

    #[test]
    fn silent_receiver_is_evicted_and_limit_relaxes() {
        let mut fc = MinMulticastFlowControl::new(1_000, 0);
        fc.on_status_message(&sm(1, 0, 8192, 64 * 1024), src(), 0, BITS, 100);
        fc.on_status_message(&sm(2, 0, 1024, 32 * 1024), src(), 0, BITS, 500);
        assert_eq!(fc.on_idle(600, 0), 1024 + 32 * 1024);

        // Receiver 1 keeps talking, receiver 2 goes silent past timeout.
        fc.on_status_message(&sm(1, 0, 8192, 64 * 1024), src(), 0, BITS, 1800);
        let limit = fc.on_idle(2000, 0);
        assert_eq!(fc.receiver_count(), 1);
        assert_eq!(limit, 8192 + 64 * 1024);
    }

    #[test]
    fn optimistic_empty_group_uses_fallback() {
        let mut fc = MinMulticastFlowControl::new(1_000, 0);
        assert_eq!(fc.on_idle(0, 128 * 1024), 128 * 1024);
    }

    #[test]
    fn required_group_withholds_until_formed() {
        let mut fc = MinMulticastFlowControl::new(1_000_000, 2);
        assert!(!fc.has_required_receivers());

        // One receiver is not enough; the fallback is not applied either.
        fc.on_status_message(&sm(1, 0, 0, 64 * 1024), src(), 0, BITS, 0);
        assert_eq!(fc.on_idle(10, 256 * 1024), 0);

        fc.on_status_message(&sm(2, 0, 0, 32 * 1024), src(), 0, BITS, 0);
        assert!(fc.has_required_receivers());
        assert_eq!(fc.on_idle(20, 256 * 1024), 32 * 1024);
    }
}
