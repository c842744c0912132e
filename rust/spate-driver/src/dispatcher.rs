//! Ingress demultiplexing: wire packets to publication images.
//!
//! A two-level index — stream interest (from subscriptions) and
//! `(session, stream) → image` — plus the pending-setup table for streams
//! seen on the wire before their image exists. The dispatcher only makes
//! routing *decisions*; the receiver executes them, which keeps this
//! directly unit-testable.

use std::collections::HashMap;

use spate_proto::SetupHeader;

/// Routing decision for a DATA/PAD frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRoute {
    /// Deliver to the image with this correlation id.
    ToImage(i64),
    /// First sighting of an interesting stream: ask the source for SETUP.
    SolicitSetup,
    /// Known pending stream; drop while creation is in flight.
    Pending,
    /// No subscription wants this stream.
    NoInterest,
}

/// Decision for a SETUP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAction {
    /// Ask the conductor to create the image.
    CreateImage,
    /// Image already exists and the SETUP matches; idempotent.
    Duplicate(i64),
    /// Image exists but the SETUP disagrees on the term layout.
    Mismatch(i64),
    /// Creation already requested; drop.
    AwaitingCreation,
    NoInterest,
}

struct ImageRef {
    correlation_id: i64,
    initial_term_id: i32,
}

struct PendingSetup {
    /// Creation has been requested from the conductor.
    in_flight: bool,
    initial_term_id: i32,
    last_solicit_ns: i64,
}

/// Per-receive-endpoint dispatcher.
pub struct DataPacketDispatcher {
    stream_interest: HashMap<i32, usize>,
    images: HashMap<(i32, i32), ImageRef>,
    pending: HashMap<(i32, i32), PendingSetup>,
}

impl DataPacketDispatcher {
    pub fn new() -> Self {
        Self {
            stream_interest: HashMap::new(),
            images: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn add_subscription(&mut self, stream_id: i32) {
        *self.stream_interest.entry(stream_id).or_insert(0) += 1;
    }

    /// Returns true when no interest in the stream remains.
    pub fn remove_subscription(&mut self, stream_id: i32) -> bool {
        if let Some(count) = self.stream_interest.get_mut(&stream_id) {
            *count -= 1;
            if *count == 0 {
                self.stream_interest.remove(&stream_id);
                self.pending.retain(|(_, stream), _| *stream != stream_id);
                return true;
            }
        }
        false
    }

    pub fn has_interest(&self, stream_id: i32) -> bool {
        self.stream_interest.contains_key(&stream_id)
    }

    pub fn is_empty(&self) -> bool {
        self.stream_interest.is_empty()
    }

    /// Route a DATA/PAD frame. `solicit_interval_ns` rate-limits repeated
    /// setup solicitation for the same pending stream.
    pub fn on_data(
        &mut self,
        session_id: i32,
        stream_id: i32,
        now_ns: i64,
        solicit_interval_ns: i64,
    ) -> DataRoute {
        let key = (session_id, stream_id);
        if let Some(image) = self.images.get(&key) {
            return DataRoute::ToImage(image.correlation_id);
        }
        if !self.has_interest(stream_id) {
            return DataRoute::NoInterest;
        }
        match self.pending.get_mut(&key) {
            Some(pending) if pending.in_flight => DataRoute::Pending,
            Some(pending) => {
                if now_ns - pending.last_solicit_ns >= solicit_interval_ns {
                    pending.last_solicit_ns = now_ns;
                    DataRoute::SolicitSetup
                } else {
                    DataRoute::Pending
                }
            }
            None => {
                self.pending.insert(
                    key,
                    PendingSetup { in_flight: false, initial_term_id: 0, last_solicit_ns: now_ns },
                );
                DataRoute::SolicitSetup
            }
        }
    }

    /// Route a SETUP frame.
    pub fn on_setup(&mut self, setup: &SetupHeader) -> SetupAction {
        let key = (setup.session_id, setup.stream_id);

        if let Some(image) = self.images.get(&key) {
            return if image.initial_term_id == setup.initial_term_id {
                SetupAction::Duplicate(image.correlation_id)
            } else {
                SetupAction::Mismatch(image.correlation_id)
            };
        }
        if !self.has_interest(setup.stream_id) {
            return SetupAction::NoInterest;
        }

        match self.pending.get_mut(&key) {
            Some(pending) if pending.in_flight => SetupAction::AwaitingCreation,
            Some(pending) => {
                pending.in_flight = true;
                pending.initial_term_id = setup.initial_term_id;
                SetupAction::CreateImage
            }
            None => {
                self.pending.insert(
                    key,
                    PendingSetup {
                        in_flight: true,
                        initial_term_id: setup.initial_term_id,
                        last_solicit_ns: 0,
                    },
                );
                SetupAction::CreateImage
            }
        }
    }

    /// Image creation could not be requested; allow a later SETUP to retry.
    pub fn on_image_rejected(&mut self, session_id: i32, stream_id: i32) {
        if let Some(pending) = self.pending.get_mut(&(session_id, stream_id)) {
            pending.in_flight = false;
        }
    }

    /// The conductor finished creating an image.
    pub fn on_image_created(
        &mut self,
        session_id: i32,
        stream_id: i32,
        correlation_id: i64,
        initial_term_id: i32,
    ) {
        let key = (session_id, stream_id);
        self.pending.remove(&key);
        self.images
            .insert(key, ImageRef { correlation_id, initial_term_id });
    }

    pub fn remove_image(&mut self, session_id: i32, stream_id: i32) {
        self.images.remove(&(session_id, stream_id));
    }
}

impl Default for DataPacketDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(session_id: i32, stream_id: i32, initial_term_id: i32) -> SetupHeader {
        SetupHeader {
            term_offset: 0,
            session_id,
            stream_id,
            initial_term_id,
            active_term_id: initial_term_id,
            term_length: 64 * 1024,
            mtu: 1408,
            ttl: 0,
        }
    }

    #[test]
    fn data_before_setup_solicits_once_per_interval() {
        let mut dispatcher = DataPacketDispatcher::new();
        dispatcher.add_subscription(10);

        assert_eq!(dispatcher.on_data(1, 10, 0, 100), DataRoute::SolicitSetup);
        assert_eq!(dispatcher.on_data(1, 10, 50, 100), DataRoute::Pending);
        assert_eq!(dispatcher.on_data(1, 10, 150, 100), DataRoute::SolicitSetup);
    }

    #[test]
    fn uninteresting_stream_is_dropped() {
        let mut dispatcher = DataPacketDispatcher::new();
        assert_eq!(dispatcher.on_data(1, 10, 0, 100), DataRoute::NoInterest);
        assert_eq!(dispatcher.on_setup(&setup(1, 10, 0)), SetupAction::NoInterest);
    }

    #[test]
    fn setup_lifecycle_to_image() {
        let mut dispatcher = DataPacketDispatcher::new();
        dispatcher.add_subscription(10);

        assert_eq!(dispatcher.on_setup(&setup(1, 10, 5)), SetupAction::CreateImage);
        // Duplicate SETUP while the conductor works: dropped.
        assert_eq!(dispatcher.on_setup(&setup(1, 10, 5)), SetupAction::AwaitingCreation);

        dispatcher.on_image_created(1, 10, 900, 5);
        assert_eq!(dispatcher.on_data(1, 10, 0, 100), DataRoute::ToImage(900));

        // Duplicate SETUP for the live image is idempotent.
        assert_eq!(dispatcher.on_setup(&setup(1, 10, 5)), SetupAction::Duplicate(900));
        // A SETUP disagreeing on the term layout is a protocol error.
        assert_eq!(dispatcher.on_setup(&setup(1, 10, 6)), SetupAction::Mismatch(900));
    }

    #[test]
    fn subscription_refcounting() {
        let mut dispatcher = DataPacketDispatcher::new();
        dispatcher.add_subscription(10);
        dispatcher.add_subscription(10);

        assert!(!dispatcher.remove_subscription(10));
        assert!(dispatcher.has_interest(10));
        assert!(dispatcher.remove_subscription(10));
        assert!(!dispatcher.has_interest(10));
    }

    #[test]
    fn sessions_are_independent() {
        let mut dispatcher = DataPacketDispatcher::new();
        dispatcher.add_subscription(10);
        dispatcher.on_image_created(1, 10, 900, 0);

        // A second session on the same stream starts its own setup dance.
        assert_eq!(dispatcher.on_data(2, 10, 0, 100), DataRoute::SolicitSetup);
        assert_eq!(dispatcher.on_data(1, 10, 0, 100), DataRoute::ToImage(900));
    }
}
