//! Destination tracking for multi-destination-cast send channels.
//!
//! With `control-mode=manual` the client drives the destination list via
//! ADD/REMOVE_DESTINATION commands; in dynamic mode destinations are
//! learned from status messages and expire when silent.

use std::net::SocketAddr;

/// Per-destination state.
#[derive(Debug, Clone, Copy)]
struct Destination {
    addr: SocketAddr,
    /// Manual destinations never expire.
    manual: bool,
    last_activity_ns: i64,
}

/// The destination set of one send channel endpoint.
pub struct DestinationTracker {
    destinations: Vec<Destination>,
    timeout_ns: i64,
}

impl DestinationTracker {
    pub fn new(timeout_ns: i64) -> Self {
        Self { destinations: Vec::new(), timeout_ns }
    }

    /// Add a manual destination; idempotent.
    pub fn add_destination(&mut self, addr: SocketAddr, now_ns: i64) {
        if let Some(existing) = self.destinations.iter_mut().find(|d| d.addr == addr) {
            existing.manual = true;
            existing.last_activity_ns = now_ns;
            return;
        }
        self.destinations.push(Destination { addr, manual: true, last_activity_ns: now_ns });
    }

    /// Remove a manual destination; returns whether it existed.
    pub fn remove_destination(&mut self, addr: SocketAddr) -> bool {
        let before = self.destinations.len();
        self.destinations.retain(|d| d.addr != addr);
        before != self.destinations.len()
    }

    /// Record activity (a status message) from a dynamic destination.
    pub fn on_activity(&mut self, addr: SocketAddr, now_ns: i64) {
        if let Some(existing) = self.destinations.iter_mut().find(|d| d.addr == addr) {
            existing.last_activity_ns = now_ns;
            return;
        }
        self.destinations.push(Destination { addr, manual: false, last_activity_ns: now_ns });
    }

    /// Drop dynamic destinations that have gone silent.
    pub fn check_expiry(&mut self, now_ns: i64) {
        let timeout = self.timeout_ns;
        self.destinations
            .retain(|d| d.manual || now_ns - d.last_activity_ns <= timeout);
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    /// Visit every current destination address.
    pub fn for_each(&self, mut handler: impl FnMut(SocketAddr)) {
        for destination in &self.destinations {
            handler(destination.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn manual_destinations_are_idempotent_and_stable() {
        let mut tracker = DestinationTracker::new(1000);
        tracker.add_destination(addr(1), 0);
        tracker.add_destination(addr(1), 0);
        assert_eq!(tracker.len(), 1);

        tracker.check_expiry(1_000_000);
        assert_eq!(tracker.len(), 1, "manual destinations never expire");

        assert!(tracker.remove_destination(addr(1)));
        assert!(!tracker.remove_destination(addr(1)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn dynamic_destinations_expire() {
        let mut tracker = DestinationTracker::new(1000);
        tracker.on_activity(addr(2), 0);
        tracker.check_expiry(500);
        assert_eq!(tracker.len(), 1);

        tracker.check_expiry(1500);
        assert!(tracker.is_empty());

        // Activity refreshes the deadline.
        tracker.on_activity(addr(2), 2000);
        tracker.on_activity(addr(2), 3000);
        tracker.check_expiry(3900);
        assert_eq!(tracker.len(), 1);
    }
}
