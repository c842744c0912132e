//! The sender agent.
//!
//! Duty cycle: drain the conductor's commands, poll send-endpoint sockets
//! for control frames (SM, NAK, RTTM), then for each publication transmit
//! whatever flow control allows, service retransmits, and heartbeat when
//! idle.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use spate_logbuffer::layout;
use spate_logbuffer::scanner;
use spate_primitives::spsc_queue::SpscQueue;
use spate_proto::{
    frame_type, DataHeader, FrameHeader, NakHeader, RttMeasurementHeader, SetupHeader,
    StatusMessageHeader, DATA_EOS_FLAG, DATA_HEADER_LENGTH, RTTM_HEADER_LENGTH,
    SETUP_HEADER_LENGTH, SM_SEND_SETUP_FLAG, UNFRAGMENTED,
};

use crate::agent::Agent;
use crate::clock::nano_time;
use crate::endpoint::SendChannelEndpoint;
use crate::proxy::SenderCmd;
use crate::publication::{NetworkPublication, PublicationState};
use crate::retransmit::NakOutcome;
use crate::system_counters::{SystemCounterId, SystemCounters};

const COMMAND_LIMIT: usize = 10;
const CONTROL_POLL_LIMIT: usize = 8;
const SEND_BURST_LIMIT: usize = 4;

/// The sender agent state.
pub struct DriverSender {
    queue: Arc<SpscQueue<SenderCmd>>,
    endpoints: HashMap<i64, SendChannelEndpoint>,
    publications: Vec<NetworkPublication>,
    counters: Arc<SystemCounters>,
    heartbeat_interval_ns: i64,
    control_buf: [u8; 2048],
}

impl DriverSender {
    pub fn new(
        queue: Arc<SpscQueue<SenderCmd>>,
        counters: Arc<SystemCounters>,
        heartbeat_interval_ns: i64,
    ) -> Self {
        Self {
            queue,
            endpoints: HashMap::new(),
            publications: Vec::new(),
            counters,
            heartbeat_interval_ns,
            control_buf: [0u8; 2048],
        }
    }

    fn drain_commands(&mut self) -> usize {
        let mut work = 0;
        for _ in 0..COMMAND_LIMIT {
            let Some(cmd) = self.queue.poll() else { break };
            work += 1;
            match cmd {
                SenderCmd::AddEndpoint(endpoint) => {
                    self.endpoints.insert(endpoint.endpoint_id, *endpoint);
                }
                SenderCmd::RemoveEndpoint { endpoint_id } => {
                    self.endpoints.remove(&endpoint_id);
                }
                SenderCmd::AddPublication(publication) => {
                    tracing::debug!(
                        registration_id = publication.shared.registration_id,
                        stream_id = publication.shared.stream_id,
                        "sender: publication added"
                    );
                    self.publications.push(*publication);
                }
                SenderCmd::RemovePublication { registration_id } => {
                    self.publications
                        .retain(|p| p.shared.registration_id != registration_id);
                }
                SenderCmd::AddDestination { endpoint_id, addr } => {
                    if let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) {
                        endpoint.destinations.add_destination(addr, nano_time());
                    }
                }
                SenderCmd::RemoveDestination { endpoint_id, addr } => {
                    if let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) {
                        endpoint.destinations.remove_destination(addr);
                    }
                }
            }
        }
        work
    }

    fn poll_control_frames(&mut self, now_ns: i64) -> io::Result<usize> {
        let mut work = 0;
        let Self { endpoints, publications, counters, control_buf, .. } = self;

        for endpoint in endpoints.values_mut() {
            for _ in 0..CONTROL_POLL_LIMIT {
                let Some((length, src)) = endpoint.poll_control(control_buf)? else { break };
                work += 1;
                let buf = &control_buf[..length];
                let Ok(header) = FrameHeader::decode(buf) else {
                    counters.get(SystemCounterId::InvalidPackets).increment();
                    continue;
                };

                match header.frame_type {
                    frame_type::SM => {
                        let Ok(sm) = StatusMessageHeader::decode(buf) else {
                            counters.get(SystemCounterId::InvalidPackets).increment();
                            continue;
                        };
                        counters.get(SystemCounterId::StatusMessagesReceived).increment();
                        on_status_message(
                            publications,
                            endpoint,
                            &sm,
                            header.flags,
                            src,
                            now_ns,
                        );
                    }
                    frame_type::NAK => {
                        let Ok(nak) = NakHeader::decode(buf) else {
                            counters.get(SystemCounterId::InvalidPackets).increment();
                            continue;
                        };
                        counters.get(SystemCounterId::NaksReceived).increment();
                        on_nak(publications, endpoint.endpoint_id, &nak, counters, now_ns);
                    }
                    frame_type::RTTM => {
                        let Ok(rttm) = RttMeasurementHeader::decode(buf) else {
                            counters.get(SystemCounterId::InvalidPackets).increment();
                            continue;
                        };
                        if !rttm.is_reply() {
                            let mut reply = [0u8; RTTM_HEADER_LENGTH];
                            RttMeasurementHeader {
                                flags: spate_proto::RTTM_REPLY_FLAG,
                                session_id: rttm.session_id,
                                stream_id: rttm.stream_id,
                                echo_timestamp_ns: rttm.echo_timestamp_ns,
                                reception_delta_ns: 0,
                                receiver_id: rttm.receiver_id,
                            }
                            .encode(&mut reply);
                            let _ = endpoint.transport.send_to(&reply, src);
                        }
                    }
                    _ => {
                        counters.get(SystemCounterId::InvalidPackets).increment();
                    }
                }
            }
        }
        Ok(work)
    }

    fn send_data(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let Self { endpoints, publications, counters, heartbeat_interval_ns, .. } = self;

        for publication in publications.iter_mut() {
            let Some(endpoint) = endpoints.get_mut(&publication.endpoint_id) else { continue };
            endpoint.destinations.check_expiry(now_ns);
            work += publication_work(
                publication,
                endpoint,
                counters,
                now_ns,
                *heartbeat_interval_ns,
            );
        }
        work
    }
}

fn on_status_message(
    publications: &mut [NetworkPublication],
    endpoint: &mut SendChannelEndpoint,
    sm: &StatusMessageHeader,
    flags: u8,
    src: SocketAddr,
    now_ns: i64,
) {
    for publication in publications.iter_mut() {
        if publication.endpoint_id != endpoint.endpoint_id
            || publication.shared.session_id != sm.session_id
            || publication.shared.stream_id != sm.stream_id
        {
            continue;
        }

        publication.shared.time_of_last_activity_ns.store(now_ns, spate_primitives::sync::Ordering::Release);

        if flags & SM_SEND_SETUP_FLAG != 0 {
            publication.should_send_setup = true;
            continue;
        }

        publication.has_seen_status_message = true;
        publication.shared.log.meta().set_connected(true);
        publication.position_limit = publication.flow_control.on_status_message(
            sm,
            src,
            publication.shared.initial_term_id,
            publication.shared.position_bits_to_shift,
            now_ns,
        );

        // Dynamic multi-destination channels learn receivers from SMs.
        if endpoint.channel.endpoint.is_none() && !endpoint.channel.manual_control {
            endpoint.destinations.on_activity(src, now_ns);
        }
    }
}

fn on_nak(
    publications: &mut [NetworkPublication],
    endpoint_id: i64,
    nak: &NakHeader,
    counters: &SystemCounters,
    now_ns: i64,
) {
    for publication in publications.iter_mut() {
        if publication.endpoint_id != endpoint_id
            || publication.shared.session_id != nak.session_id
            || publication.shared.stream_id != nak.stream_id
        {
            continue;
        }
        match publication
            .retransmit
            .on_nak(nak.term_id, nak.term_offset, nak.length, now_ns)
        {
            NakOutcome::CapacityExceeded => {
                counters.get(SystemCounterId::RetransmitOverflows).increment();
            }
            NakOutcome::Scheduled | NakOutcome::Duplicate => {}
        }
    }
}

fn publication_work(
    publication: &mut NetworkPublication,
    endpoint: &SendChannelEndpoint,
    counters: &SystemCounters,
    now_ns: i64,
    heartbeat_interval_ns: i64,
) -> usize {
    let mut work = 0;
    let state = publication.shared.state();
    if state == PublicationState::Closed {
        return 0;
    }

    // Flow control periodic pass (receiver eviction, optimistic fallback).
    let fallback =
        publication.sender_position + publication.shared.term_window_length as i64;
    publication.position_limit = publication.flow_control.on_idle(now_ns, fallback);
    publication.shared.sender_limit.set(publication.position_limit);

    // Producers may run ahead of the sender by at most the term window.
    if state == PublicationState::Active {
        publication
            .shared
            .publisher_limit
            .propose_max(publication.sender_position + publication.shared.term_window_length as i64);
    }

    // SETUP: initially, on solicitation, and periodically until connected.
    if publication.should_send_setup
        || (!publication.has_seen_status_message
            && now_ns - publication.time_of_last_setup_ns >= heartbeat_interval_ns)
    {
        send_setup(publication, endpoint, now_ns);
        publication.should_send_setup = false;
        publication.time_of_last_setup_ns = now_ns;
        work += 1;
    }

    // Data.
    if publication.flow_control.has_required_receivers() {
        for _ in 0..SEND_BURST_LIMIT {
            let (term, offset, outcome) = publication.scan_for_send();
            if outcome.available == 0 {
                break;
            }
            // SAFETY: the scanner only reports committed bytes.
            let bytes = unsafe { term.bytes(offset, outcome.available) };
            match endpoint.send(bytes) {
                Ok(result) => {
                    if result.datagrams > 0 {
                        counters
                            .get(SystemCounterId::BytesSent)
                            .add(outcome.available as i64 * result.datagrams as i64);
                    }
                    if result.short_sends > 0 {
                        counters
                            .get(SystemCounterId::ShortSends)
                            .add(result.short_sends as i64);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        stream_id = publication.shared.stream_id,
                        "send failed: {e}"
                    );
                    break;
                }
            }
            publication.sender_position += outcome.advance() as i64;
            publication.shared.sender_position.set(publication.sender_position);
            publication
                .shared
                .time_of_last_activity_ns
                .store(now_ns, spate_primitives::sync::Ordering::Release);
            publication.time_of_last_send_ns = now_ns;
            work += 1;
        }
    }

    // Heartbeat on idle; carries EOS once the publication is winding down.
    if now_ns - publication.time_of_last_send_ns >= heartbeat_interval_ns {
        send_heartbeat(publication, endpoint, state != PublicationState::Active);
        counters.get(SystemCounterId::HeartbeatsSent).increment();
        publication.time_of_last_send_ns = now_ns;
        work += 1;
    }

    // Retransmits: out-of-band, sender position untouched. Chunk on frame
    // boundaries via the scanner so no datagram bisects a frame.
    let NetworkPublication { shared, retransmit, .. } = publication;
    let mtu = shared.mtu_length;
    let retransmits = retransmit.process(now_ns, |term_id, term_offset, length| {
        let term_count = term_id.wrapping_sub(shared.initial_term_id);
        let term = shared.log.term(layout::index_by_term_count(term_count));
        let end = (term_offset as usize + length as usize).min(term.len());
        let mut offset = term_offset as usize;
        while offset < end {
            let outcome = scanner::scan_for_availability(term, offset, mtu.min(end - offset));
            if outcome.available == 0 {
                break;
            }
            // SAFETY: the scanner only reports committed bytes.
            let bytes = unsafe { term.bytes(offset, outcome.available) };
            if endpoint.send(bytes).is_err() {
                break;
            }
            counters
                .get(SystemCounterId::BytesSent)
                .add(outcome.available as i64);
            offset += outcome.advance();
        }
    });
    if retransmits > 0 {
        counters
            .get(SystemCounterId::RetransmitsSent)
            .add(retransmits as i64);
        work += retransmits;
    }

    work
}

fn send_setup(publication: &NetworkPublication, endpoint: &SendChannelEndpoint, _now_ns: i64) {
    let mut buf = [0u8; SETUP_HEADER_LENGTH];
    SetupHeader {
        term_offset: publication.term_offset(),
        session_id: publication.shared.session_id,
        stream_id: publication.shared.stream_id,
        initial_term_id: publication.shared.initial_term_id,
        active_term_id: publication.active_term_id(),
        term_length: publication.shared.term_length as i32,
        mtu: publication.shared.mtu_length as i32,
        ttl: endpoint.channel.ttl,
    }
    .encode(&mut buf);
    let _ = endpoint.send(&buf);
}

fn send_heartbeat(publication: &NetworkPublication, endpoint: &SendChannelEndpoint, eos: bool) {
    let mut buf = [0u8; DATA_HEADER_LENGTH];
    DataHeader {
        frame_length: 0,
        flags: if eos { UNFRAGMENTED | DATA_EOS_FLAG } else { UNFRAGMENTED },
        frame_type: frame_type::DATA,
        term_offset: publication.term_offset(),
        session_id: publication.shared.session_id,
        stream_id: publication.shared.stream_id,
        term_id: publication.active_term_id(),
        reserved_value: 0,
    }
    .encode(&mut buf);
    let _ = endpoint.send(&buf);
}

impl Agent for DriverSender {
    fn role_name(&self) -> &'static str {
        "sender"
    }

    fn do_work(&mut self) -> io::Result<usize> {
        let now_ns = nano_time();
        let mut work = self.drain_commands();
        work += self.poll_control_frames(now_ns)?;
        work += self.send_data(now_ns);
        Ok(work)
    }

    fn on_close(&mut self) {
        self.publications.clear();
        self.endpoints.clear();
        tracing::debug!("sender closed");
    }
}
