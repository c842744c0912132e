//! A minimal in-process client.
//!
//! Enough of the client side of the CnC protocol to drive the driver from
//! integration tests and embedding applications: add publications and
//! subscriptions, offer messages through the term appender, poll images,
//! and keep the client session alive. Production clients live in their own
//! library; this one trades completeness for directness.

use std::path::Path;
use std::time::{Duration, Instant};

use spate_logbuffer::appender::{AppendOutcome, TermAppender};
use spate_logbuffer::layout::{
    self, align_frame_length, frame_length_volatile, frame_type as term_frame_type, LogBuffers,
};
use spate_logbuffer::position::{compute_position, position_bits_to_shift};
use spate_primitives::broadcast::BroadcastReceiver;
use spate_primitives::counters::AtomicCounter;
use spate_primitives::region::Region;
use spate_primitives::rings::MpscRingBuffer;
use spate_proto::{frame_type, DATA_HEADER_LENGTH};

use crate::cnc::CncFile;
use crate::commands::*;
use crate::error::DriverError;

const AWAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a [`Publication::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Committed; the stream position after the message.
    Ok(i64),
    /// The producer limit is in the way; retry later.
    BackPressured,
    /// No subscriber is connected yet.
    NotConnected,
    /// Message exceeds the maximum message length.
    TooLong,
}

/// Client handle to a publication's log buffer.
pub struct Publication {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    log: LogBuffers,
    limit: AtomicCounter,
    max_payload: usize,
    max_message: usize,
}

impl Publication {
    /// Offer a message; fragments transparently up to `max_message`.
    pub fn offer(&mut self, payload: &[u8]) -> Offer {
        let meta = self.log.meta();
        if !meta.is_connected() {
            return Offer::NotConnected;
        }

        for _ in 0..2 {
            let term_count = meta.active_term_count();
            let partition = layout::index_by_term_count(term_count);
            let term_id = meta.initial_term_id.wrapping_add(term_count);

            let raw_tail = meta.tail_counters[partition]
                .load(spate_primitives::sync::Ordering::Acquire);
            let term_length = self.log.term_length();
            let bits = position_bits_to_shift(term_length);
            let position = compute_position(
                layout::term_id(raw_tail),
                layout::term_offset(raw_tail, term_length),
                bits,
                meta.initial_term_id,
            );
            let required = align_frame_length(DATA_HEADER_LENGTH + payload.len());
            if position + required as i64 > self.limit.get() {
                return Offer::BackPressured;
            }

            let appender = TermAppender::new(self.log.term(partition), meta, partition);
            match appender.append_fragmented(payload, self.max_payload, self.max_message) {
                AppendOutcome::Appended { new_tail_offset } => {
                    return Offer::Ok(compute_position(
                        term_id,
                        new_tail_offset,
                        bits,
                        meta.initial_term_id,
                    ));
                }
                AppendOutcome::Tripped => {
                    // Zero the partition being re-entered (it holds the
                    // term from three rotations ago) and rotate. Another
                    // publisher racing on the same trip rotates first and
                    // the count check keeps us off the fresh partition.
                    if meta.active_term_count() == term_count {
                        let next = layout::index_by_term_count(term_count + 1);
                        let next_term = self.log.term(next);
                        next_term.set_zero(0, next_term.len());
                        layout::rotate_log(meta, term_count, term_id);
                    }
                }
                AppendOutcome::MaxMessageExceeded => return Offer::TooLong,
            }
        }
        Offer::BackPressured
    }

    /// Current producer position.
    pub fn position(&self) -> i64 {
        let meta = self.log.meta();
        let term_count = meta.active_term_count();
        let raw_tail = meta.tail_counters[layout::index_by_term_count(term_count)]
            .load(spate_primitives::sync::Ordering::Acquire);
        let term_length = self.log.term_length();
        compute_position(
            layout::term_id(raw_tail),
            layout::term_offset(raw_tail, term_length),
            position_bits_to_shift(term_length),
            meta.initial_term_id,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.log.meta().is_connected()
    }
}

/// Client handle to a subscription; images attach as they become
/// available.
pub struct Subscription {
    pub registration_id: i64,
    pub stream_id: i32,
}

/// One mapped image of a remote (or IPC) publication.
pub struct SubscriptionImage {
    pub correlation_id: i64,
    pub session_id: i32,
    pub source_identity: String,
    log: LogBuffers,
    position_counter: AtomicCounter,
    position: i64,
}

impl SubscriptionImage {
    /// Poll committed frames in order; `handler(payload)` per data frame.
    pub fn poll(&mut self, mut handler: impl FnMut(&[u8]), limit: usize) -> usize {
        let term_length = self.log.term_length();
        let bits = position_bits_to_shift(term_length);
        let mut count = 0;

        while count < limit {
            let term_count = (self.position >> bits) as i32;
            let partition = layout::index_by_term_count(term_count);
            let offset = (self.position & (term_length as i64 - 1)) as usize;
            let term = self.log.term(partition);

            let frame_length = frame_length_volatile(term, offset);
            if frame_length <= 0 {
                break;
            }
            let aligned = align_frame_length(frame_length as usize);

            if term_frame_type(term, offset) == frame_type::DATA {
                // SAFETY: committed frame bytes behind the acquired length.
                let payload = unsafe {
                    term.bytes(offset + DATA_HEADER_LENGTH, frame_length as usize - DATA_HEADER_LENGTH)
                };
                handler(payload);
                count += 1;
            }
            self.position += aligned as i64;
        }

        if count > 0 {
            self.position_counter.set(self.position);
        }
        count
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// True once the publisher closed the stream and this image consumed
    /// up to the final position.
    pub fn is_end_of_stream(&self) -> bool {
        self.log.meta().end_of_stream_position() <= self.position
    }
}

enum Inbound {
    Error(ErrorEvent),
    PublicationReady(PublicationReadyEvent),
    SubscriptionReady(SubscriptionReadyEvent),
    ImageReady(ImageReadyEvent),
    ImageUnavailable(ImageUnavailableEvent),
    CounterReady(CounterReadyEvent),
    OperationSuccess(CorrelatedEvent),
    ClientTimeout(CorrelatedEvent),
}

/// The client session: command ring producer + event receiver.
pub struct SpateClient {
    cnc: CncFile,
    command_ring: MpscRingBuffer,
    events: BroadcastReceiver,
    pub client_id: i64,
    inbox: Vec<Inbound>,
    /// Images announced but not yet claimed by `try_next_image`.
    pending_images: Vec<ImageReadyEvent>,
    unavailable_images: Vec<ImageUnavailableEvent>,
    timed_out_clients: Vec<i64>,
}

impl SpateClient {
    pub fn connect(dir: &Path) -> Result<Self, DriverError> {
        let cnc = CncFile::attach(dir)?;
        let command_ring = MpscRingBuffer::new(cnc.to_driver_region())
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let events = BroadcastReceiver::new(cnc.to_clients_region())
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let client_id = command_ring.next_correlation_id();
        Ok(Self {
            cnc,
            command_ring,
            events,
            client_id,
            inbox: Vec::new(),
            pending_images: Vec::new(),
            unavailable_images: Vec::new(),
            timed_out_clients: Vec::new(),
        })
    }

    fn values_region(&self) -> Region {
        self.cnc.counters_values_region()
    }

    fn send_command(&self, msg_type: i32, payload: &[u8]) -> Result<(), DriverError> {
        for _ in 0..1000 {
            match self.command_ring.write(msg_type, payload) {
                Ok(()) => return Ok(()),
                Err(spate_primitives::rings::RingBufferError::InsufficientCapacity) => {
                    std::thread::yield_now();
                }
                Err(e) => return Err(DriverError::Command(e.to_string())),
            }
        }
        Err(DriverError::BackPressure)
    }

    /// Pump the broadcast buffer into the inbox.
    pub fn poll_events(&mut self) {
        let mut raw = Vec::new();
        loop {
            let received = self.events.receive(|t, p| raw.push((t, p.to_vec())));
            match received {
                spate_primitives::broadcast::BroadcastReceive::Message => continue,
                spate_primitives::broadcast::BroadcastReceive::Lapped => continue,
                spate_primitives::broadcast::BroadcastReceive::Idle => break,
            }
        }

        for (event, payload) in raw {
            let decoded = match event {
                event_type::ON_ERROR => ErrorEvent::decode(&payload).map(Inbound::Error),
                event_type::ON_PUBLICATION_READY => {
                    PublicationReadyEvent::decode(&payload).map(Inbound::PublicationReady)
                }
                event_type::ON_SUBSCRIPTION_READY => {
                    SubscriptionReadyEvent::decode(&payload).map(Inbound::SubscriptionReady)
                }
                event_type::ON_AVAILABLE_IMAGE => {
                    ImageReadyEvent::decode(&payload).map(Inbound::ImageReady)
                }
                event_type::ON_UNAVAILABLE_IMAGE => {
                    ImageUnavailableEvent::decode(&payload).map(Inbound::ImageUnavailable)
                }
                event_type::ON_COUNTER_READY => {
                    CounterReadyEvent::decode(&payload).map(Inbound::CounterReady)
                }
                event_type::ON_OPERATION_SUCCESS => {
                    CorrelatedEvent::decode(&payload).map(Inbound::OperationSuccess)
                }
                event_type::ON_CLIENT_TIMEOUT => {
                    CorrelatedEvent::decode(&payload).map(Inbound::ClientTimeout)
                }
                _ => continue,
            };
            if let Ok(decoded) = decoded {
                match decoded {
                    Inbound::ImageReady(image) => self.pending_images.push(image),
                    Inbound::ImageUnavailable(image) => self.unavailable_images.push(image),
                    Inbound::ClientTimeout(event) => {
                        self.timed_out_clients.push(event.correlation_id);
                    }
                    other => self.inbox.push(other),
                }
            }
        }
    }

    fn await_from_inbox<T>(
        &mut self,
        correlation_id: i64,
        mut matcher: impl FnMut(&Inbound) -> Option<T>,
    ) -> Result<T, DriverError> {
        let deadline = Instant::now() + AWAIT_TIMEOUT;
        loop {
            self.poll_events();

            let mut error = None;
            let mut found = None;
            self.inbox.retain(|inbound| {
                if found.is_some() || error.is_some() {
                    return true;
                }
                if let Inbound::Error(e) = inbound {
                    if e.offending_correlation_id == correlation_id {
                        error = Some(e.clone());
                        return false;
                    }
                }
                match matcher(inbound) {
                    Some(value) => {
                        found = Some(value);
                        false
                    }
                    None => true,
                }
            });

            if let Some(error) = error {
                return Err(DriverError::Command(format!(
                    "driver rejected command: {} (code {})",
                    error.message, error.error_code
                )));
            }
            if let Some(found) = found {
                return Ok(found);
            }
            if Instant::now() > deadline {
                return Err(DriverError::Command(format!(
                    "timed out waiting for response to {correlation_id}"
                )));
            }
            std::thread::yield_now();
        }
    }

    pub fn add_publication(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Publication, DriverError> {
        let correlation_id = self.command_ring.next_correlation_id();
        let cmd = ChannelCommand {
            correlated: Correlated { client_id: self.client_id, correlation_id },
            stream_id,
            channel: channel.to_string(),
        };
        self.send_command(command_type::ADD_PUBLICATION, &cmd.encode())?;

        let ready = self.await_from_inbox(correlation_id, |inbound| match inbound {
            Inbound::PublicationReady(ready) if ready.correlation_id == correlation_id => {
                Some(ready.clone())
            }
            _ => None,
        })?;

        let log = LogBuffers::attach(Path::new(&ready.log_file))?;
        let mtu = log.mtu_length();
        let term_length = log.term_length();
        Ok(Publication {
            registration_id: ready.registration_id,
            session_id: ready.session_id,
            stream_id: ready.stream_id,
            limit: AtomicCounter::new(self.values_region(), ready.position_limit_counter_id),
            max_payload: mtu - DATA_HEADER_LENGTH,
            max_message: term_length / 8,
            log,
        })
    }

    pub fn add_subscription(
        &mut self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Subscription, DriverError> {
        let correlation_id = self.command_ring.next_correlation_id();
        let cmd = ChannelCommand {
            correlated: Correlated { client_id: self.client_id, correlation_id },
            stream_id,
            channel: channel.to_string(),
        };
        self.send_command(command_type::ADD_SUBSCRIPTION, &cmd.encode())?;

        self.await_from_inbox(correlation_id, |inbound| match inbound {
            Inbound::SubscriptionReady(ready) if ready.correlation_id == correlation_id => {
                Some(())
            }
            _ => None,
        })?;
        Ok(Subscription { registration_id: correlation_id, stream_id })
    }

    /// Claim the next image announced for `subscription`, if any.
    pub fn try_next_image(
        &mut self,
        subscription: &Subscription,
    ) -> Result<Option<SubscriptionImage>, DriverError> {
        self.poll_events();
        let index = self
            .pending_images
            .iter()
            .position(|i| i.subscription_registration_id == subscription.registration_id);
        let Some(index) = index else { return Ok(None) };
        let ready = self.pending_images.swap_remove(index);

        let log = LogBuffers::attach(Path::new(&ready.log_file))?;
        let position_counter =
            AtomicCounter::new(self.values_region(), ready.subscriber_position_counter_id);
        let position = position_counter.get();
        Ok(Some(SubscriptionImage {
            correlation_id: ready.correlation_id,
            session_id: ready.session_id,
            source_identity: ready.source_identity,
            log,
            position_counter,
            position,
        }))
    }

    /// An ON_UNAVAILABLE_IMAGE arrived for `subscription`.
    pub fn image_unavailable(&mut self, subscription: &Subscription) -> bool {
        self.poll_events();
        self.unavailable_images
            .iter()
            .any(|i| i.subscription_registration_id == subscription.registration_id)
    }

    pub fn remove_publication(&mut self, publication: &Publication) -> Result<(), DriverError> {
        let correlation_id = self.command_ring.next_correlation_id();
        let cmd = RemoveCommand {
            correlated: Correlated { client_id: self.client_id, correlation_id },
            registration_id: publication.registration_id,
        };
        self.send_command(command_type::REMOVE_PUBLICATION, &cmd.encode())?;
        self.await_from_inbox(correlation_id, |inbound| match inbound {
            Inbound::OperationSuccess(event) if event.correlation_id == correlation_id => Some(()),
            _ => None,
        })
    }

    pub fn remove_subscription(&mut self, subscription: Subscription) -> Result<(), DriverError> {
        let correlation_id = self.command_ring.next_correlation_id();
        let cmd = RemoveCommand {
            correlated: Correlated { client_id: self.client_id, correlation_id },
            registration_id: subscription.registration_id,
        };
        self.send_command(command_type::REMOVE_SUBSCRIPTION, &cmd.encode())?;
        self.await_from_inbox(correlation_id, |inbound| match inbound {
            Inbound::OperationSuccess(event) if event.correlation_id == correlation_id => Some(()),
            _ => None,
        })
    }

    pub fn add_counter(
        &mut self,
        type_id: i32,
        key: &[u8],
        label: &str,
    ) -> Result<i32, DriverError> {
        let correlation_id = self.command_ring.next_correlation_id();
        let cmd = CounterCommand {
            correlated: Correlated { client_id: self.client_id, correlation_id },
            type_id,
            key: key.to_vec(),
            label: label.to_string(),
        };
        self.send_command(command_type::ADD_COUNTER, &cmd.encode())?;
        self.await_from_inbox(correlation_id, |inbound| match inbound {
            Inbound::CounterReady(ready) if ready.correlation_id == correlation_id => {
                Some(ready.counter_id)
            }
            _ => None,
        })
    }

    pub fn send_keepalive(&self) -> Result<(), DriverError> {
        let cmd = Correlated { client_id: self.client_id, correlation_id: 0 };
        self.send_command(command_type::CLIENT_KEEPALIVE, &cmd.encode())
    }

    /// Whether the driver declared `client_id` dead.
    pub fn observed_client_timeout(&mut self, client_id: i64) -> bool {
        self.poll_events();
        self.timed_out_clients.contains(&client_id)
    }

    /// Read a system counter value by id.
    pub fn counter_value(&self, counter_id: i32) -> i64 {
        AtomicCounter::new(self.values_region(), counter_id).get()
    }
}
