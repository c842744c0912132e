//! The receiver agent.
//!
//! Duty cycle: drain the conductor's commands, poll every receive-endpoint
//! socket through the transport poller and dispatch each frame, then walk
//! the images to emit due status messages, run loss detection, and solicit
//! RTT measurements.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use spate_primitives::spsc_queue::SpscQueue;
use spate_proto::{frame_type, DataHeader, FrameHeader, RttMeasurementHeader, SetupHeader};

use crate::agent::Agent;
use crate::clock::{epoch_ms, nano_time};
use crate::dispatcher::{DataRoute, SetupAction};
use crate::endpoint::ReceiveChannelEndpoint;
use crate::image::{OnDataOutcome, PublicationImage};
use crate::loss_report::LossReporter;
use crate::proxy::{ConductorCmd, DriverConductorProxy, ReceiverCmd};
use crate::system_counters::{SystemCounterId, SystemCounters};

const COMMAND_LIMIT: usize = 10;
const PACKETS_PER_ENDPOINT: usize = 64;

/// The receiver agent state.
pub struct DriverReceiver {
    queue: Arc<SpscQueue<ReceiverCmd>>,
    conductor_proxy: DriverConductorProxy,
    endpoints: HashMap<i64, ReceiveChannelEndpoint>,
    images: HashMap<i64, PublicationImage>,
    poller: crate::udp::TransportPoller,
    ready: Vec<i64>,
    counters: Arc<SystemCounters>,
    loss_reporter: LossReporter,
    sm_timeout_ns: i64,
    setup_solicit_interval_ns: i64,
    recv_buf: Vec<u8>,
}

impl DriverReceiver {
    pub fn new(
        queue: Arc<SpscQueue<ReceiverCmd>>,
        conductor_proxy: DriverConductorProxy,
        counters: Arc<SystemCounters>,
        loss_reporter: LossReporter,
        sm_timeout_ns: i64,
        setup_solicit_interval_ns: i64,
    ) -> Self {
        Self {
            queue,
            conductor_proxy,
            endpoints: HashMap::new(),
            images: HashMap::new(),
            poller: crate::udp::TransportPoller::new(),
            ready: Vec::new(),
            counters,
            loss_reporter,
            sm_timeout_ns,
            setup_solicit_interval_ns,
            recv_buf: vec![0u8; 64 * 1024],
        }
    }

    fn drain_commands(&mut self) -> usize {
        let mut work = 0;
        for _ in 0..COMMAND_LIMIT {
            let Some(cmd) = self.queue.poll() else { break };
            work += 1;
            match cmd {
                ReceiverCmd::AddEndpoint(endpoint) => {
                    self.poller.register(endpoint.transport.fd(), endpoint.endpoint_id);
                    self.endpoints.insert(endpoint.endpoint_id, *endpoint);
                }
                ReceiverCmd::RemoveEndpoint { endpoint_id } => {
                    self.poller.unregister(endpoint_id);
                    self.endpoints.remove(&endpoint_id);
                }
                ReceiverCmd::AddSubscription { endpoint_id, stream_id } => {
                    if let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) {
                        endpoint.dispatcher.add_subscription(stream_id);
                    }
                }
                ReceiverCmd::RemoveSubscription { endpoint_id, stream_id } => {
                    if let Some(endpoint) = self.endpoints.get_mut(&endpoint_id) {
                        endpoint.dispatcher.remove_subscription(stream_id);
                    }
                }
                ReceiverCmd::NewImage(image) => {
                    if let Some(endpoint) = self.endpoints.get_mut(&image.endpoint_id) {
                        endpoint.dispatcher.on_image_created(
                            image.shared.session_id,
                            image.shared.stream_id,
                            image.shared.correlation_id,
                            image.shared.initial_term_id,
                        );
                    }
                    self.counters.get(SystemCounterId::ImagesCreated).increment();
                    self.images.insert(image.shared.correlation_id, *image);
                }
                ReceiverCmd::RemoveImage { correlation_id } => {
                    if let Some(image) = self.images.remove(&correlation_id) {
                        if let Some(endpoint) = self.endpoints.get_mut(&image.endpoint_id) {
                            endpoint
                                .dispatcher
                                .remove_image(image.shared.session_id, image.shared.stream_id);
                        }
                        self.counters.get(SystemCounterId::ImagesClosed).increment();
                    }
                }
            }
        }
        work
    }

    fn poll_sockets(&mut self, now_ns: i64) -> io::Result<usize> {
        let mut work = 0;
        let Self {
            endpoints,
            images,
            counters,
            conductor_proxy,
            poller,
            ready,
            recv_buf,
            setup_solicit_interval_ns,
            ..
        } = self;

        poller.poll(ready)?;

        for &endpoint_id in ready.iter() {
            for _ in 0..PACKETS_PER_ENDPOINT {
                let received = match endpoints.get(&endpoint_id) {
                    Some(endpoint) => endpoint.transport.recv_from(recv_buf)?,
                    None => break,
                };
                let Some((length, src)) = received else { break };
                work += 1;
                dispatch_packet(
                    endpoints,
                    images,
                    counters,
                    conductor_proxy,
                    *setup_solicit_interval_ns,
                    endpoint_id,
                    &recv_buf[..length],
                    src,
                    now_ns,
                );
            }
        }
        Ok(work)
    }

    fn image_duty(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let Self { endpoints, images, counters, loss_reporter, sm_timeout_ns, .. } = self;

        for image in images.values_mut() {
            let Some(endpoint) = endpoints.get(&image.endpoint_id) else { continue };

            // Status messages.
            if let Some((term_id, term_offset, window)) =
                image.status_message_if_due(now_ns, *sm_timeout_ns)
            {
                let sent = endpoint.send_status_message(
                    image.control_address,
                    image.shared.session_id,
                    image.shared.stream_id,
                    term_id,
                    term_offset,
                    window,
                    image.receiver_id,
                    0,
                );
                if matches!(sent, Ok(true)) {
                    counters.get(SystemCounterId::StatusMessagesSent).increment();
                    work += 1;
                }
            }

            // Loss detection: NAK on reliable streams, pad over the gap on
            // unreliable ones.
            let mut gaps = Vec::new();
            image.detect_loss(now_ns, |gap| gaps.push(*gap));
            for gap in &gaps {
                if image.reliable {
                    let sent = endpoint.send_nak(
                        image.control_address,
                        image.shared.session_id,
                        image.shared.stream_id,
                        gap.term_id,
                        gap.term_offset,
                        gap.length,
                    );
                    if matches!(sent, Ok(true)) {
                        counters.get(SystemCounterId::NaksSent).increment();
                        work += 1;
                    }
                } else {
                    image.fill_gap(loss_reporter, gap, epoch_ms());
                    counters.get(SystemCounterId::LossGapFills).increment();
                    work += 1;
                }
            }

            // RTT solicitation.
            if image.congestion_control.should_measure_rtt(now_ns) {
                let _ = endpoint.send_rttm(
                    image.control_address,
                    image.shared.session_id,
                    image.shared.stream_id,
                    now_ns,
                    0,
                    image.receiver_id,
                    false,
                );
            }
        }
        work
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_packet(
    endpoints: &mut HashMap<i64, ReceiveChannelEndpoint>,
    images: &mut HashMap<i64, PublicationImage>,
    counters: &SystemCounters,
    conductor_proxy: &DriverConductorProxy,
    setup_solicit_interval_ns: i64,
    endpoint_id: i64,
    packet: &[u8],
    src: SocketAddr,
    now_ns: i64,
) {
    let Ok(header) = FrameHeader::decode(packet) else {
        counters.get(SystemCounterId::InvalidPackets).increment();
        return;
    };

    match header.frame_type {
        frame_type::DATA | frame_type::PAD => {
            let Ok(data) = DataHeader::decode(packet) else {
                counters.get(SystemCounterId::InvalidPackets).increment();
                return;
            };
            let Some(endpoint) = endpoints.get_mut(&endpoint_id) else { return };
            let route = endpoint.dispatcher.on_data(
                data.session_id,
                data.stream_id,
                now_ns,
                setup_solicit_interval_ns,
            );
            match route {
                DataRoute::ToImage(correlation_id) => {
                    if let Some(image) = images.get_mut(&correlation_id) {
                        match image.on_data(&data, packet, now_ns) {
                            OnDataOutcome::Inserted(bytes) => {
                                counters
                                    .get(SystemCounterId::BytesReceived)
                                    .add(bytes as i64);
                            }
                            OnDataOutcome::Heartbeat => {
                                counters.get(SystemCounterId::HeartbeatsReceived).increment();
                            }
                            OnDataOutcome::WindowOverrun => {
                                counters
                                    .get(SystemCounterId::FlowControlOverRuns)
                                    .increment();
                            }
                        }
                    }
                }
                DataRoute::SolicitSetup => {
                    let _ = endpoint.send_setup_elicitation(src, data.session_id, data.stream_id);
                    counters.get(SystemCounterId::StatusMessagesSent).increment();
                }
                DataRoute::Pending | DataRoute::NoInterest => {}
            }
        }
        frame_type::SETUP => {
            let Ok(setup) = SetupHeader::decode(packet) else {
                counters.get(SystemCounterId::InvalidPackets).increment();
                return;
            };
            let Some(endpoint) = endpoints.get_mut(&endpoint_id) else { return };
            match endpoint.dispatcher.on_setup(&setup) {
                SetupAction::CreateImage => {
                    tracing::debug!(
                        session_id = setup.session_id,
                        stream_id = setup.stream_id,
                        "receiver: requesting image creation"
                    );
                    let offered = conductor_proxy.offer(ConductorCmd::CreateImage {
                        endpoint_id,
                        setup,
                        control_address: src,
                        source_identity: src.to_string(),
                    });
                    if !offered {
                        counters.get(SystemCounterId::BackPressureEvents).increment();
                        endpoint
                            .dispatcher
                            .on_image_rejected(setup.session_id, setup.stream_id);
                    }
                }
                SetupAction::Mismatch(_) => {
                    counters.get(SystemCounterId::InvalidPackets).increment();
                }
                SetupAction::Duplicate(_)
                | SetupAction::AwaitingCreation
                | SetupAction::NoInterest => {}
            }
        }
        frame_type::RTTM => {
            let Ok(rttm) = RttMeasurementHeader::decode(packet) else {
                counters.get(SystemCounterId::InvalidPackets).increment();
                return;
            };
            if rttm.is_reply() {
                let rtt_ns = (now_ns - rttm.echo_timestamp_ns).max(0);
                for image in images.values_mut() {
                    if image.endpoint_id == endpoint_id
                        && image.shared.session_id == rttm.session_id
                        && image.shared.stream_id == rttm.stream_id
                    {
                        image.congestion_control.on_rttm(now_ns, rtt_ns);
                    }
                }
            }
        }
        _ => {
            // SM and NAK belong on the send path.
            counters.get(SystemCounterId::InvalidPackets).increment();
        }
    }
}

impl Agent for DriverReceiver {
    fn role_name(&self) -> &'static str {
        "receiver"
    }

    fn do_work(&mut self) -> io::Result<usize> {
        let now_ns = nano_time();
        let mut work = self.drain_commands();
        work += self.poll_sockets(now_ns)?;
        work += self.image_duty(now_ns);
        Ok(work)
    }

    fn on_close(&mut self) {
        self.images.clear();
        self.endpoints.clear();
        tracing::debug!("receiver closed");
    }
}
