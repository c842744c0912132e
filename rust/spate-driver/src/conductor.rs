//! The driver conductor.
//!
//! Sole mutator of the global registries: clients, publications,
//! subscriptions, endpoints, images. Consumes client commands from the
//! MPSC command ring, emits correlated events on the broadcast buffer,
//! services the receiver's create-image requests, and runs every timer
//! (client liveness, publication drain/linger/unblock, image liveness).

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use spate_logbuffer::layout::{self, LogBuffers};
use spate_logbuffer::position::{
    compute_position, compute_term_id_from_position, compute_term_offset_from_position,
};
use spate_logbuffer::unblocker::{self, UnblockStatus};
use spate_primitives::broadcast::BroadcastTransmitter;
use spate_primitives::counters::CountersManager;
use spate_primitives::error_log::DistinctErrorLog;
use spate_primitives::rings::MpscRingBuffer;
use spate_primitives::spsc_queue::SpscQueue;
use spate_primitives::sync::Ordering;

use crate::agent::Agent;
use crate::clock::{epoch_ms, nano_time};
use crate::commands::*;
use crate::config::{CongestionControlStrategy, DriverConfig, FlowControlStrategy};
use crate::congestion_control::{
    CongestionControl, CubicCongestionControl, StaticWindowCongestionControl,
};
use crate::endpoint::{ReceiveChannelEndpoint, SendChannelEndpoint};
use crate::error::{error_code, DriverError};
use crate::flow_control::{FlowControl, MinMulticastFlowControl, UnicastFlowControl};
use crate::image::{ImageShared, ImageState, PublicationImage};
use crate::loss_detector::{FeedbackDelayGenerator, LossDetector};
use crate::proxy::{ConductorCmd, ReceiverCmd, ReceiverProxy, SenderCmd, SenderProxy};
use crate::publication::{
    IpcPublication, NetworkPublication, PublicationShared, PublicationState,
};
use crate::retransmit::RetransmitHandler;
use crate::system_counters::{counter_type, SystemCounterId, SystemCounters};
use crate::udp::UdpChannel;
use crate::uri::ChannelUri;

const COMMAND_LIMIT: usize = 10;
const TIMER_INTERVAL_NS: i64 = 1_000_000;

struct ClientSession {
    time_of_last_keepalive_ns: i64,
}

struct NetworkPublicationEntry {
    shared: Arc<PublicationShared>,
    counter_ids: [i32; 3],
    client_id: i64,
    ref_count: usize,
    endpoint_id: i64,
    channel_canonical: String,
    linger_deadline_ns: i64,
    last_consumer_position: i64,
    time_of_last_consumer_change_ns: i64,
}

struct IpcPublicationEntry {
    publication: IpcPublication,
    publisher_limit_counter_id: i32,
    client_id: i64,
    ref_count: usize,
    linger_deadline_ns: i64,
    last_consumer_position: i64,
    time_of_last_consumer_change_ns: i64,
}

struct SubscriptionEntry {
    registration_id: i64,
    client_id: i64,
    stream_id: i32,
    is_ipc: bool,
    channel_canonical: String,
    endpoint_id: Option<i64>,
    /// IPC links: (publication registration id, subscriber counter id).
    ipc_links: Vec<(i64, i32)>,
}

struct ImageEntry {
    shared: Arc<ImageShared>,
    counter_ids: Vec<i32>,
    endpoint_id: i64,
    subscription_ids: Vec<i64>,
    linger_deadline_ns: i64,
}

struct EndpointRef {
    endpoint_id: i64,
    ref_count: usize,
}

struct RecvEndpointInfo {
    canonical: String,
    is_multicast: bool,
    reliable: bool,
    channel: String,
}

/// The conductor agent state.
pub struct DriverConductor {
    config: DriverConfig,
    command_ring: MpscRingBuffer,
    broadcast: BroadcastTransmitter,
    counters: CountersManager,
    system: Arc<SystemCounters>,
    error_log: DistinctErrorLog,
    sender_proxy: SenderProxy,
    receiver_proxy: ReceiverProxy,
    conductor_queue: Arc<SpscQueue<ConductorCmd>>,

    clients: HashMap<i64, ClientSession>,
    network_publications: HashMap<i64, NetworkPublicationEntry>,
    ipc_publications: HashMap<i64, IpcPublicationEntry>,
    subscriptions: HashMap<i64, SubscriptionEntry>,
    send_endpoints: HashMap<String, EndpointRef>,
    recv_endpoints: HashMap<String, EndpointRef>,
    recv_endpoint_info: HashMap<i64, RecvEndpointInfo>,
    images: HashMap<i64, ImageEntry>,

    next_session_id: i32,
    next_id: i64,
    last_timer_check_ns: i64,
    command_scratch: Vec<(i32, Vec<u8>)>,
}

impl DriverConductor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DriverConfig,
        command_ring: MpscRingBuffer,
        broadcast: BroadcastTransmitter,
        counters: CountersManager,
        system: Arc<SystemCounters>,
        error_log: DistinctErrorLog,
        sender_proxy: SenderProxy,
        receiver_proxy: ReceiverProxy,
        conductor_queue: Arc<SpscQueue<ConductorCmd>>,
    ) -> Self {
        Self {
            config,
            command_ring,
            broadcast,
            counters,
            system,
            error_log,
            sender_proxy,
            receiver_proxy,
            conductor_queue,
            clients: HashMap::new(),
            network_publications: HashMap::new(),
            ipc_publications: HashMap::new(),
            subscriptions: HashMap::new(),
            send_endpoints: HashMap::new(),
            recv_endpoints: HashMap::new(),
            recv_endpoint_info: HashMap::new(),
            images: HashMap::new(),
            next_session_id: 1,
            next_id: 1,
            last_timer_check_ns: 0,
            command_scratch: Vec::new(),
        }
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ── event emission ───────────────────────────────────────────────────────

    fn transmit(&mut self, event_type: i32, payload: &[u8]) {
        if self.broadcast.transmit(event_type, payload).is_err() {
            self.system.get(SystemCounterId::BackPressureEvents).increment();
            self.error_log.record(
                error_code::BACK_PRESSURE,
                "event exceeded broadcast record limit",
                epoch_ms(),
            );
        }
    }

    fn on_error(&mut self, correlation_id: i64, error: &DriverError) {
        tracing::warn!(correlation_id, "command failed: {error}");
        self.system.get(SystemCounterId::Errors).increment();
        self.error_log.record(error.code(), &error.to_string(), epoch_ms());
        let event = ErrorEvent {
            offending_correlation_id: correlation_id,
            error_code: error.code(),
            message: error.to_string(),
        }
        .encode();
        self.transmit(event_type::ON_ERROR, &event);
    }

    fn operation_succeeded(&mut self, correlation_id: i64) {
        let event = CorrelatedEvent { correlation_id }.encode();
        self.transmit(event_type::ON_OPERATION_SUCCESS, &event);
    }

    // ── client commands ──────────────────────────────────────────────────────

    fn on_client_command(&mut self, msg_type: i32, payload: &[u8], now_ns: i64) {
        self.system.get(SystemCounterId::ClientCommands).increment();

        let result = match msg_type {
            command_type::ADD_PUBLICATION => self.on_add_publication(payload, now_ns),
            command_type::REMOVE_PUBLICATION => self.on_remove_publication(payload, now_ns),
            command_type::ADD_SUBSCRIPTION => self.on_add_subscription(payload, now_ns),
            command_type::REMOVE_SUBSCRIPTION => self.on_remove_subscription(payload, now_ns),
            command_type::CLIENT_KEEPALIVE => {
                if let Ok(correlated) = Correlated::decode(payload) {
                    self.client_seen(correlated.client_id, now_ns);
                }
                Ok(())
            }
            command_type::ADD_COUNTER => self.on_add_counter(payload, now_ns),
            command_type::REMOVE_COUNTER => self.on_remove_counter(payload, now_ns),
            command_type::ADD_DESTINATION => self.on_destination(payload, now_ns, true),
            command_type::REMOVE_DESTINATION => self.on_destination(payload, now_ns, false),
            command_type::CLIENT_CLOSE => {
                if let Ok(correlated) = Correlated::decode(payload) {
                    self.on_client_gone(correlated.client_id, now_ns, false);
                }
                Ok(())
            }
            unknown => {
                let correlation_id = Correlated::decode(payload)
                    .map(|c| c.correlation_id)
                    .unwrap_or(-1);
                Err((
                    correlation_id,
                    DriverError::Command(format!("unknown command type {unknown:#x}")),
                ))
            }
        };

        if let Err((correlation_id, error)) = result {
            self.on_error(correlation_id, &error);
        }
    }

    fn client_seen(&mut self, client_id: i64, now_ns: i64) {
        self.clients
            .entry(client_id)
            .or_insert(ClientSession { time_of_last_keepalive_ns: now_ns })
            .time_of_last_keepalive_ns = now_ns;
    }

    fn on_add_publication(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, DriverError)> {
        let cmd = ChannelCommand::decode(payload).map_err(|e| (-1, e))?;
        let correlation_id = cmd.correlated.correlation_id;
        self.client_seen(cmd.correlated.client_id, now_ns);

        let uri = ChannelUri::parse(&cmd.channel).map_err(|e| (correlation_id, e))?;
        if uri.is_ipc() {
            self.add_ipc_publication(&cmd, now_ns).map_err(|e| (correlation_id, e))
        } else {
            self.add_network_publication(&cmd, &uri, now_ns)
                .map_err(|e| (correlation_id, e))
        }
    }

    fn log_file_path(&self, registration_id: i64) -> PathBuf {
        self.config.dir.join(format!("{registration_id}.logbuffer"))
    }

    fn add_network_publication(
        &mut self,
        cmd: &ChannelCommand,
        uri: &ChannelUri,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        let channel = UdpChannel::from_uri(uri)?;
        let canonical = channel.canonical.clone();

        // Non-exclusive publications on the same channel + stream share a log.
        let existing = self
            .network_publications
            .values()
            .find(|p| p.channel_canonical == canonical
                && p.shared.stream_id == cmd.stream_id
                && p.shared.state() == PublicationState::Active)
            .map(|p| (p.shared.registration_id, p.shared.session_id, p.counter_ids[0]));
        if let Some((registration_id, session_id, counter_id)) = existing {
            if let Some(entry) = self.network_publications.get_mut(&registration_id) {
                entry.ref_count += 1;
            }
            let event = PublicationReadyEvent {
                correlation_id: cmd.correlated.correlation_id,
                registration_id,
                session_id,
                stream_id: cmd.stream_id,
                position_limit_counter_id: counter_id,
                log_file: self.log_file_path(registration_id).to_string_lossy().into_owned(),
            }
            .encode();
            self.transmit(event_type::ON_PUBLICATION_READY, &event);
            return Ok(());
        }

        let endpoint_id = self.get_or_create_send_endpoint(&channel)?;

        let registration_id = cmd.correlated.correlation_id;
        let session_id = match uri.session_id()? {
            Some(session_id) => session_id,
            None => {
                let session_id = self.next_session_id;
                self.next_session_id += 1;
                session_id
            }
        };
        let term_length = uri.term_length()?.unwrap_or(self.config.term_buffer_length);
        layout::check_term_length(term_length)
            .map_err(|e| DriverError::Channel(format!("term-length: {e}")))?;
        let mtu = uri.mtu()?.unwrap_or(self.config.mtu_length);
        let initial_term_id = uri.initial_term_id()?.unwrap_or(0);

        let log_path = self.log_file_path(registration_id);
        let log = LogBuffers::create(
            &log_path,
            term_length,
            initial_term_id,
            mtu,
            self.config.file_page_size,
            session_id,
            cmd.stream_id,
            self.config.pre_touch_mapped_memory,
        )?;

        let now_ms = epoch_ms();
        let key = registration_id.to_le_bytes();
        let label_tail = format!("{registration_id} {session_id} {} {}", cmd.stream_id, cmd.channel);
        let publisher_limit = self
            .counters
            .allocate(counter_type::PUBLISHER_LIMIT, &key, &format!("pub-lmt: {label_tail}"), now_ms)
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let sender_position = self
            .counters
            .allocate(counter_type::SENDER_POSITION, &key, &format!("snd-pos: {label_tail}"), now_ms)
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let sender_limit = self
            .counters
            .allocate(counter_type::SENDER_LIMIT, &key, &format!("snd-lmt: {label_tail}"), now_ms)
            .map_err(|e| DriverError::Config(e.to_string()))?;

        let term_window = self.config.term_window_length(term_length);
        let shared = Arc::new(PublicationShared::new(
            registration_id,
            session_id,
            cmd.stream_id,
            cmd.channel.clone(),
            log,
            term_window,
            publisher_limit,
            sender_position,
            sender_limit,
        ));
        shared.publisher_limit.set(term_window as i64);
        shared
            .time_of_last_activity_ns
            .store(now_ns, Ordering::Release);

        let flow_control = self.new_flow_control(&channel);
        let retransmit = RetransmitHandler::new(
            self.config.max_retransmits,
            self.config.retransmit_unicast_delay_ns,
            self.config.retransmit_unicast_linger_ns,
        );
        let publication = NetworkPublication::new(
            Arc::clone(&shared),
            endpoint_id,
            flow_control,
            retransmit,
        );
        if !self.sender_proxy.offer(SenderCmd::AddPublication(Box::new(publication))) {
            self.system.get(SystemCounterId::BackPressureEvents).increment();
            return Err(DriverError::BackPressure);
        }

        self.network_publications.insert(
            registration_id,
            NetworkPublicationEntry {
                shared,
                counter_ids: [publisher_limit.id(), sender_position.id(), sender_limit.id()],
                client_id: cmd.correlated.client_id,
                ref_count: 1,
                endpoint_id,
                channel_canonical: canonical,
                linger_deadline_ns: i64::MAX,
                last_consumer_position: 0,
                time_of_last_consumer_change_ns: now_ns,
            },
        );

        tracing::info!(
            registration_id,
            session_id,
            stream_id = cmd.stream_id,
            channel = %cmd.channel,
            "network publication created"
        );

        let event = PublicationReadyEvent {
            correlation_id: cmd.correlated.correlation_id,
            registration_id,
            session_id,
            stream_id: cmd.stream_id,
            position_limit_counter_id: publisher_limit.id(),
            log_file: log_path.to_string_lossy().into_owned(),
        }
        .encode();
        self.transmit(event_type::ON_PUBLICATION_READY, &event);
        Ok(())
    }

    fn new_flow_control(&self, channel: &UdpChannel) -> Box<dyn FlowControl> {
        if channel.is_multicast {
            let group_size = match self.config.flow_control {
                FlowControlStrategy::MulticastMinGroup { group_size } => group_size,
                _ => 0,
            };
            Box::new(MinMulticastFlowControl::new(
                self.config.flow_control_receiver_timeout_ns,
                group_size,
            ))
        } else {
            Box::new(UnicastFlowControl::new())
        }
    }

    fn add_ipc_publication(
        &mut self,
        cmd: &ChannelCommand,
        now_ns: i64,
    ) -> Result<(), DriverError> {
        let existing = self
            .ipc_publications
            .values()
            .find(|p| p.publication.shared.stream_id == cmd.stream_id
                && p.publication.shared.state() == PublicationState::Active)
            .map(|p| {
                (
                    p.publication.shared.registration_id,
                    p.publication.shared.session_id,
                    p.publisher_limit_counter_id,
                )
            });
        if let Some((registration_id, session_id, counter_id)) = existing {
            if let Some(entry) = self.ipc_publications.get_mut(&registration_id) {
                entry.ref_count += 1;
            }
            let event = PublicationReadyEvent {
                correlation_id: cmd.correlated.correlation_id,
                registration_id,
                session_id,
                stream_id: cmd.stream_id,
                position_limit_counter_id: counter_id,
                log_file: self.log_file_path(registration_id).to_string_lossy().into_owned(),
            }
            .encode();
            self.transmit(event_type::ON_PUBLICATION_READY, &event);
            return Ok(());
        }

        let registration_id = cmd.correlated.correlation_id;
        let session_id = self.next_session_id;
        self.next_session_id += 1;
        let term_length = self.config.ipc_term_buffer_length;

        let log_path = self.log_file_path(registration_id);
        let log = LogBuffers::create(
            &log_path,
            term_length,
            0,
            self.config.mtu_length,
            self.config.file_page_size,
            session_id,
            cmd.stream_id,
            self.config.pre_touch_mapped_memory,
        )?;

        let now_ms = epoch_ms();
        let key = registration_id.to_le_bytes();
        let publisher_limit = self
            .counters
            .allocate(
                counter_type::PUBLISHER_LIMIT,
                &key,
                &format!("pub-lmt: {registration_id} {session_id} {} spate:ipc", cmd.stream_id),
                now_ms,
            )
            .map_err(|e| DriverError::Config(e.to_string()))?;

        let term_window = self.config.term_window_length(term_length);
        // IPC publications have no sender; the sender position and limit
        // counters are not allocated for them.
        let shared = Arc::new(PublicationShared::new(
            registration_id,
            session_id,
            cmd.stream_id,
            cmd.channel.clone(),
            log,
            term_window,
            publisher_limit,
            publisher_limit,
            publisher_limit,
        ));
        shared.publisher_limit.set(term_window as i64);

        let mut entry = IpcPublicationEntry {
            publication: IpcPublication::new(Arc::clone(&shared)),
            publisher_limit_counter_id: publisher_limit.id(),
            client_id: cmd.correlated.client_id,
            ref_count: 1,
            linger_deadline_ns: i64::MAX,
            last_consumer_position: 0,
            time_of_last_consumer_change_ns: now_ns,
        };

        // Wire up the IPC subscriptions already waiting on this stream.
        let waiting: Vec<i64> = self
            .subscriptions
            .values()
            .filter(|s| s.is_ipc && s.stream_id == cmd.stream_id)
            .map(|s| s.registration_id)
            .collect();
        for subscription_id in waiting {
            self.link_ipc_subscriber(&mut entry, subscription_id)?;
        }

        let event = PublicationReadyEvent {
            correlation_id: cmd.correlated.correlation_id,
            registration_id,
            session_id,
            stream_id: cmd.stream_id,
            position_limit_counter_id: publisher_limit.id(),
            log_file: log_path.to_string_lossy().into_owned(),
        }
        .encode();
        self.transmit(event_type::ON_PUBLICATION_READY, &event);

        tracing::info!(registration_id, session_id, stream_id = cmd.stream_id, "ipc publication created");
        self.ipc_publications.insert(registration_id, entry);
        Ok(())
    }

    fn link_ipc_subscriber(
        &mut self,
        entry: &mut IpcPublicationEntry,
        subscription_id: i64,
    ) -> Result<(), DriverError> {
        let shared = &entry.publication.shared;
        let join_position = shared.producer_position();
        let key = shared.registration_id.to_le_bytes();
        let counter = self
            .counters
            .allocate(
                counter_type::SUBSCRIBER_POSITION,
                &key,
                &format!(
                    "sub-pos: {} {} {} spate:ipc @{join_position}",
                    subscription_id, shared.session_id, shared.stream_id
                ),
                epoch_ms(),
            )
            .map_err(|e| DriverError::Config(e.to_string()))?;
        counter.set(join_position);
        entry.publication.subscriber_positions.push(counter);
        shared.log.meta().set_connected(true);

        if let Some(subscription) = self.subscriptions.get_mut(&subscription_id) {
            subscription.ipc_links.push((shared.registration_id, counter.id()));
        }

        let event = ImageReadyEvent {
            correlation_id: shared.registration_id,
            subscription_registration_id: subscription_id,
            session_id: shared.session_id,
            stream_id: shared.stream_id,
            subscriber_position_counter_id: counter.id(),
            log_file: self
                .log_file_path(shared.registration_id)
                .to_string_lossy()
                .into_owned(),
            source_identity: "spate:ipc".to_string(),
        }
        .encode();
        self.transmit(event_type::ON_AVAILABLE_IMAGE, &event);
        Ok(())
    }

    fn get_or_create_send_endpoint(&mut self, channel: &UdpChannel) -> Result<i64, DriverError> {
        if let Some(existing) = self.send_endpoints.get_mut(&channel.canonical) {
            existing.ref_count += 1;
            return Ok(existing.endpoint_id);
        }

        let endpoint_id = self.next_id();
        let endpoint = SendChannelEndpoint::new(endpoint_id, channel.clone(), &self.config)?;
        if !self.sender_proxy.offer(SenderCmd::AddEndpoint(Box::new(endpoint))) {
            return Err(DriverError::BackPressure);
        }
        self.send_endpoints
            .insert(channel.canonical.clone(), EndpointRef { endpoint_id, ref_count: 1 });
        Ok(endpoint_id)
    }

    fn get_or_create_recv_endpoint(
        &mut self,
        uri: &ChannelUri,
        channel: &UdpChannel,
    ) -> Result<i64, DriverError> {
        if let Some(existing) = self.recv_endpoints.get_mut(&channel.canonical) {
            existing.ref_count += 1;
            return Ok(existing.endpoint_id);
        }

        let endpoint_id = self.next_id();
        let endpoint = ReceiveChannelEndpoint::new(endpoint_id, channel.clone(), &self.config)?;
        if !self.receiver_proxy.offer(ReceiverCmd::AddEndpoint(Box::new(endpoint))) {
            return Err(DriverError::BackPressure);
        }
        self.recv_endpoints
            .insert(channel.canonical.clone(), EndpointRef { endpoint_id, ref_count: 1 });
        self.recv_endpoint_info.insert(
            endpoint_id,
            RecvEndpointInfo {
                canonical: channel.canonical.clone(),
                is_multicast: channel.is_multicast,
                reliable: channel.reliable,
                channel: uri.original().to_string(),
            },
        );
        Ok(endpoint_id)
    }

    fn on_add_subscription(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, DriverError)> {
        let cmd = ChannelCommand::decode(payload).map_err(|e| (-1, e))?;
        let correlation_id = cmd.correlated.correlation_id;
        self.client_seen(cmd.correlated.client_id, now_ns);

        let uri = ChannelUri::parse(&cmd.channel).map_err(|e| (correlation_id, e))?;
        let registration_id = correlation_id;

        if uri.is_ipc() {
            self.subscriptions.insert(
                registration_id,
                SubscriptionEntry {
                    registration_id,
                    client_id: cmd.correlated.client_id,
                    stream_id: cmd.stream_id,
                    is_ipc: true,
                    channel_canonical: "spate:ipc".to_string(),
                    endpoint_id: None,
                    ipc_links: Vec::new(),
                },
            );
            let event = SubscriptionReadyEvent { correlation_id }.encode();
            self.transmit(event_type::ON_SUBSCRIPTION_READY, &event);

            // Attach to IPC publications already live on this stream.
            let live: Vec<i64> = self
                .ipc_publications
                .iter()
                .filter(|(_, p)| {
                    p.publication.shared.stream_id == cmd.stream_id
                        && p.publication.shared.state() == PublicationState::Active
                })
                .map(|(&id, _)| id)
                .collect();
            for publication_id in live {
                if let Some(mut entry) = self.ipc_publications.remove(&publication_id) {
                    let result = self.link_ipc_subscriber(&mut entry, registration_id);
                    self.ipc_publications.insert(publication_id, entry);
                    result.map_err(|e| (correlation_id, e))?;
                }
            }
            return Ok(());
        }

        let channel = UdpChannel::from_uri(&uri).map_err(|e| (correlation_id, e))?;
        let endpoint_id = self
            .get_or_create_recv_endpoint(&uri, &channel)
            .map_err(|e| (correlation_id, e))?;
        if !self
            .receiver_proxy
            .offer(ReceiverCmd::AddSubscription { endpoint_id, stream_id: cmd.stream_id })
        {
            return Err((correlation_id, DriverError::BackPressure));
        }

        self.subscriptions.insert(
            registration_id,
            SubscriptionEntry {
                registration_id,
                client_id: cmd.correlated.client_id,
                stream_id: cmd.stream_id,
                is_ipc: false,
                channel_canonical: channel.canonical.clone(),
                endpoint_id: Some(endpoint_id),
                ipc_links: Vec::new(),
            },
        );

        tracing::info!(
            registration_id,
            stream_id = cmd.stream_id,
            channel = %cmd.channel,
            "subscription created"
        );
        let event = SubscriptionReadyEvent { correlation_id }.encode();
        self.transmit(event_type::ON_SUBSCRIPTION_READY, &event);
        Ok(())
    }

    fn on_remove_publication(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, DriverError)> {
        let cmd = RemoveCommand::decode(payload).map_err(|e| (-1, e))?;
        let correlation_id = cmd.correlated.correlation_id;
        self.client_seen(cmd.correlated.client_id, now_ns);

        if let Some(entry) = self.network_publications.get_mut(&cmd.registration_id) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                begin_network_drain(entry, now_ns);
            }
            self.operation_succeeded(correlation_id);
            return Ok(());
        }
        if let Some(entry) = self.ipc_publications.get_mut(&cmd.registration_id) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                begin_ipc_drain(entry, now_ns);
            }
            self.operation_succeeded(correlation_id);
            return Ok(());
        }
        Err((
            correlation_id,
            DriverError::Command(format!("unknown publication {}", cmd.registration_id)),
        ))
    }

    fn on_remove_subscription(
        &mut self,
        payload: &[u8],
        now_ns: i64,
    ) -> Result<(), (i64, DriverError)> {
        let cmd = RemoveCommand::decode(payload).map_err(|e| (-1, e))?;
        let correlation_id = cmd.correlated.correlation_id;
        self.client_seen(cmd.correlated.client_id, now_ns);

        let Some(entry) = self.subscriptions.remove(&cmd.registration_id) else {
            return Err((
                correlation_id,
                DriverError::Command(format!("unknown subscription {}", cmd.registration_id)),
            ));
        };

        self.release_subscription(entry, now_ns);
        self.operation_succeeded(correlation_id);
        Ok(())
    }

    fn release_subscription(&mut self, entry: SubscriptionEntry, now_ns: i64) {
        if entry.is_ipc {
            for (publication_id, counter_id) in &entry.ipc_links {
                if let Some(publication) = self.ipc_publications.get_mut(publication_id) {
                    publication
                        .publication
                        .subscriber_positions
                        .retain(|c| c.id() != *counter_id);
                    if publication.publication.subscriber_positions.is_empty() {
                        publication.publication.shared.log.meta().set_connected(false);
                    }
                }
                self.counters.free(*counter_id, epoch_ms());
            }
            return;
        }

        if let Some(endpoint_id) = entry.endpoint_id {
            let _ = self.receiver_proxy.offer(ReceiverCmd::RemoveSubscription {
                endpoint_id,
                stream_id: entry.stream_id,
            });

            // Images under this subscription become unavailable.
            let affected: Vec<i64> = self
                .images
                .iter()
                .filter(|(_, image)| image.subscription_ids.contains(&entry.registration_id))
                .map(|(&id, _)| id)
                .collect();
            for image_id in affected {
                self.begin_image_drain(image_id, now_ns);
            }

            let mut drop_endpoint = None;
            if let Some(endpoint_ref) = self.recv_endpoints.get_mut(&entry.channel_canonical) {
                endpoint_ref.ref_count -= 1;
                if endpoint_ref.ref_count == 0 {
                    drop_endpoint = Some(endpoint_ref.endpoint_id);
                }
            }
            if let Some(endpoint_id) = drop_endpoint {
                self.recv_endpoints.remove(&entry.channel_canonical);
                self.recv_endpoint_info.remove(&endpoint_id);
                let _ = self.receiver_proxy.offer(ReceiverCmd::RemoveEndpoint { endpoint_id });
            }
        }
    }

    fn on_add_counter(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, DriverError)> {
        let cmd = CounterCommand::decode(payload).map_err(|e| (-1, e))?;
        let correlation_id = cmd.correlated.correlation_id;
        self.client_seen(cmd.correlated.client_id, now_ns);

        let counter = self
            .counters
            .allocate(cmd.type_id, &cmd.key, &cmd.label, epoch_ms())
            .map_err(|e| (correlation_id, DriverError::Config(e.to_string())))?;
        let event = CounterReadyEvent { correlation_id, counter_id: counter.id() }.encode();
        self.transmit(event_type::ON_COUNTER_READY, &event);
        Ok(())
    }

    fn on_remove_counter(&mut self, payload: &[u8], now_ns: i64) -> Result<(), (i64, DriverError)> {
        let cmd = RemoveCommand::decode(payload).map_err(|e| (-1, e))?;
        self.client_seen(cmd.correlated.client_id, now_ns);
        self.counters.free(cmd.registration_id as i32, epoch_ms());
        self.operation_succeeded(cmd.correlated.correlation_id);
        Ok(())
    }

    fn on_destination(
        &mut self,
        payload: &[u8],
        now_ns: i64,
        add: bool,
    ) -> Result<(), (i64, DriverError)> {
        let cmd = DestinationCommand::decode(payload).map_err(|e| (-1, e))?;
        let correlation_id = cmd.correlated.correlation_id;
        self.client_seen(cmd.correlated.client_id, now_ns);

        let Some(entry) = self.network_publications.get(&cmd.registration_id) else {
            return Err((
                correlation_id,
                DriverError::Command(format!("unknown publication {}", cmd.registration_id)),
            ));
        };

        let uri = ChannelUri::parse(&cmd.channel).map_err(|e| (correlation_id, e))?;
        let addr = uri
            .endpoint()
            .map_err(|e| (correlation_id, e))?
            .ok_or_else(|| {
                (correlation_id, DriverError::Channel("destination needs endpoint".into()))
            })?;

        let sent = if add {
            self.sender_proxy
                .offer(SenderCmd::AddDestination { endpoint_id: entry.endpoint_id, addr })
        } else {
            self.sender_proxy
                .offer(SenderCmd::RemoveDestination { endpoint_id: entry.endpoint_id, addr })
        };
        if !sent {
            return Err((correlation_id, DriverError::BackPressure));
        }
        self.operation_succeeded(correlation_id);
        Ok(())
    }

    // ── receiver requests ────────────────────────────────────────────────────

    fn on_create_image(&mut self, cmd: ConductorCmd) {
        let ConductorCmd::CreateImage { endpoint_id, setup, control_address, source_identity } =
            cmd;

        let subscription_ids: Vec<i64> = self
            .subscriptions
            .values()
            .filter(|s| s.endpoint_id == Some(endpoint_id) && s.stream_id == setup.stream_id)
            .map(|s| s.registration_id)
            .collect();
        if subscription_ids.is_empty() {
            return; // interest vanished while the request was queued
        }
        let Some(info) = self.recv_endpoint_info.get(&endpoint_id) else { return };
        let reliable = info.reliable;
        let is_multicast = info.is_multicast;
        let channel = info.channel.clone();

        let term_length = setup.term_length as usize;
        if layout::check_term_length(term_length).is_err() {
            self.system.get(SystemCounterId::InvalidPackets).increment();
            return;
        }

        let correlation_id = self.next_id();
        let result = self.create_image(
            correlation_id,
            endpoint_id,
            &setup,
            control_address,
            &source_identity,
            channel,
            reliable,
            is_multicast,
            &subscription_ids,
        );
        if let Err(error) = result {
            self.on_error(-1, &error);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_image(
        &mut self,
        correlation_id: i64,
        endpoint_id: i64,
        setup: &spate_proto::SetupHeader,
        control_address: std::net::SocketAddr,
        source_identity: &str,
        channel: String,
        reliable: bool,
        is_multicast: bool,
        subscription_ids: &[i64],
    ) -> Result<(), DriverError> {
        let term_length = setup.term_length as usize;
        let log_path = self.log_file_path(correlation_id);
        let log = LogBuffers::create(
            &log_path,
            term_length,
            setup.initial_term_id,
            setup.mtu as usize,
            self.config.file_page_size,
            setup.session_id,
            setup.stream_id,
            self.config.pre_touch_mapped_memory,
        )?;

        let bits = spate_logbuffer::position::position_bits_to_shift(term_length);
        let join_position =
            compute_position(setup.active_term_id, setup.term_offset, bits, setup.initial_term_id);

        let now_ms = epoch_ms();
        let key = correlation_id.to_le_bytes();
        let label_tail = format!(
            "{correlation_id} {} {} {channel}",
            setup.session_id, setup.stream_id
        );
        let hwm = self
            .counters
            .allocate(counter_type::RECEIVER_HWM, &key, &format!("rcv-hwm: {label_tail}"), now_ms)
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let rebuild = self
            .counters
            .allocate(counter_type::RECEIVER_POSITION, &key, &format!("rcv-pos: {label_tail}"), now_ms)
            .map_err(|e| DriverError::Config(e.to_string()))?;

        let mut counter_ids = vec![hwm.id(), rebuild.id()];
        let mut subscriber_positions = Vec::new();
        let mut subscriber_counter_ids = Vec::new();
        for subscription_id in subscription_ids {
            let counter = self
                .counters
                .allocate(
                    counter_type::SUBSCRIBER_POSITION,
                    &key,
                    &format!("sub-pos: {subscription_id} {label_tail} @{join_position}"),
                    now_ms,
                )
                .map_err(|e| DriverError::Config(e.to_string()))?;
            counter_ids.push(counter.id());
            subscriber_counter_ids.push(counter.id());
            subscriber_positions.push(counter);
        }

        let shared = Arc::new(ImageShared::new(
            correlation_id,
            setup.session_id,
            setup.stream_id,
            channel,
            source_identity.to_string(),
            log,
            hwm,
            rebuild,
            subscriber_positions,
        ));
        shared.set_state(ImageState::Active);
        shared
            .time_of_last_packet_ns
            .store(nano_time(), Ordering::Release);

        let window = (self.config.initial_window_length.min(term_length / 2)) as i32;
        let congestion_control: Box<dyn CongestionControl> = match self.config.congestion_control {
            CongestionControlStrategy::StaticWindow => {
                Box::new(StaticWindowCongestionControl::new(window))
            }
            CongestionControlStrategy::Cubic => Box::new(CubicCongestionControl::new(
                setup.mtu,
                window,
                self.config.status_message_timeout_ns,
            )),
        };

        let delay_generator = if is_multicast {
            FeedbackDelayGenerator::Multicast {
                max_backoff_ns: self.config.nak_multicast_max_backoff_ns,
                group_size: self.config.nak_multicast_group_size,
                seed: correlation_id as u64 ^ 0x9e37_79b9_7f4a_7c15,
            }
        } else {
            FeedbackDelayGenerator::Static { delay_ns: self.config.nak_unicast_delay_ns }
        };
        let loss_detector =
            LossDetector::new(delay_generator, self.config.nak_multicast_max_backoff_ns.max(1));

        let image = PublicationImage::new(
            Arc::clone(&shared),
            endpoint_id,
            control_address,
            correlation_id,
            reliable,
            congestion_control,
            loss_detector,
            join_position,
        );
        if !self.receiver_proxy.offer(ReceiverCmd::NewImage(Box::new(image))) {
            self.system.get(SystemCounterId::BackPressureEvents).increment();
            return Err(DriverError::BackPressure);
        }

        tracing::info!(
            correlation_id,
            session_id = setup.session_id,
            stream_id = setup.stream_id,
            source = %source_identity,
            "image created"
        );

        for (subscription_id, counter_id) in
            subscription_ids.iter().zip(subscriber_counter_ids.iter())
        {
            let event = ImageReadyEvent {
                correlation_id,
                subscription_registration_id: *subscription_id,
                session_id: setup.session_id,
                stream_id: setup.stream_id,
                subscriber_position_counter_id: *counter_id,
                log_file: log_path.to_string_lossy().into_owned(),
                source_identity: source_identity.to_string(),
            }
            .encode();
            self.transmit(event_type::ON_AVAILABLE_IMAGE, &event);
        }

        self.images.insert(
            correlation_id,
            ImageEntry {
                shared,
                counter_ids,
                endpoint_id,
                subscription_ids: subscription_ids.to_vec(),
                linger_deadline_ns: i64::MAX,
            },
        );
        Ok(())
    }

    // ── timers ───────────────────────────────────────────────────────────────

    fn on_timer_check(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        work += self.check_clients(now_ns);
        work += self.check_network_publications(now_ns);
        work += self.check_ipc_publications(now_ns);
        work += self.check_images(now_ns);
        work
    }

    fn check_clients(&mut self, now_ns: i64) -> usize {
        let timeout = self.config.client_liveness_timeout_ns;
        let expired: Vec<i64> = self
            .clients
            .iter()
            .filter(|(_, c)| now_ns - c.time_of_last_keepalive_ns > timeout)
            .map(|(&id, _)| id)
            .collect();

        for client_id in &expired {
            tracing::warn!(client_id, "client timed out");
            self.on_client_gone(*client_id, now_ns, true);
        }
        expired.len()
    }

    fn on_client_gone(&mut self, client_id: i64, now_ns: i64, timed_out: bool) {
        self.clients.remove(&client_id);

        for entry in self.network_publications.values_mut() {
            if entry.client_id == client_id && entry.linger_deadline_ns == i64::MAX {
                entry.ref_count = 0;
                begin_network_drain(entry, now_ns);
            }
        }
        for entry in self.ipc_publications.values_mut() {
            if entry.client_id == client_id && entry.linger_deadline_ns == i64::MAX {
                entry.ref_count = 0;
                begin_ipc_drain(entry, now_ns);
            }
        }

        let owned: Vec<i64> = self
            .subscriptions
            .values()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.registration_id)
            .collect();
        for registration_id in owned {
            if let Some(entry) = self.subscriptions.remove(&registration_id) {
                self.release_subscription(entry, now_ns);
            }
        }

        if timed_out {
            self.system.get(SystemCounterId::ClientTimeouts).increment();
            let event = CorrelatedEvent { correlation_id: client_id }.encode();
            self.transmit(event_type::ON_CLIENT_TIMEOUT, &event);
        }
    }

    fn check_network_publications(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let mut to_close = Vec::new();

        for (&registration_id, entry) in self.network_publications.iter_mut() {
            match entry.shared.state() {
                PublicationState::Active => {
                    work += check_publication_unblock(
                        entry.shared.as_ref(),
                        &mut entry.last_consumer_position,
                        &mut entry.time_of_last_consumer_change_ns,
                        entry.shared.sender_position.get(),
                        self.config.publication_unblock_timeout_ns,
                        now_ns,
                        &self.system,
                    );
                }
                PublicationState::Draining => {
                    let sent_everything =
                        entry.shared.sender_position.get() >= entry.shared.producer_position();
                    if sent_everything || now_ns >= entry.linger_deadline_ns {
                        entry.shared.set_state(PublicationState::Linger);
                        entry.linger_deadline_ns =
                            now_ns + self.config.publication_linger_timeout_ns;
                        work += 1;
                    }
                }
                PublicationState::Linger => {
                    if now_ns >= entry.linger_deadline_ns {
                        to_close.push(registration_id);
                    }
                }
                PublicationState::Closed => to_close.push(registration_id),
            }
        }

        for registration_id in to_close {
            work += 1;
            self.close_network_publication(registration_id);
        }
        work
    }

    fn close_network_publication(&mut self, registration_id: i64) {
        let Some(entry) = self.network_publications.remove(&registration_id) else { return };
        entry.shared.set_state(PublicationState::Closed);
        let _ = self
            .sender_proxy
            .offer(SenderCmd::RemovePublication { registration_id });

        let now_ms = epoch_ms();
        for counter_id in entry.counter_ids {
            self.counters.free(counter_id, now_ms);
        }

        let mut drop_endpoint = None;
        if let Some(endpoint_ref) = self.send_endpoints.get_mut(&entry.channel_canonical) {
            endpoint_ref.ref_count -= 1;
            if endpoint_ref.ref_count == 0 {
                drop_endpoint = Some(endpoint_ref.endpoint_id);
            }
        }
        if let Some(endpoint_id) = drop_endpoint {
            self.send_endpoints.remove(&entry.channel_canonical);
            let _ = self.sender_proxy.offer(SenderCmd::RemoveEndpoint { endpoint_id });
        }
        tracing::info!(registration_id, "network publication closed");
    }

    fn check_ipc_publications(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let mut to_close = Vec::new();

        for (&registration_id, entry) in self.ipc_publications.iter_mut() {
            match entry.publication.shared.state() {
                PublicationState::Active => {
                    entry.publication.update_publisher_limit();
                    let consumed = entry
                        .publication
                        .min_subscriber_position()
                        .unwrap_or_else(|| entry.publication.shared.producer_position());
                    work += check_publication_unblock(
                        entry.publication.shared.as_ref(),
                        &mut entry.last_consumer_position,
                        &mut entry.time_of_last_consumer_change_ns,
                        consumed,
                        self.config.publication_unblock_timeout_ns,
                        now_ns,
                        &self.system,
                    );
                }
                PublicationState::Draining => {
                    let eos = entry.publication.shared.log.meta().end_of_stream_position();
                    let drained = entry
                        .publication
                        .min_subscriber_position()
                        .map(|min| min >= eos)
                        .unwrap_or(true);
                    if drained || now_ns >= entry.linger_deadline_ns {
                        entry.publication.shared.set_state(PublicationState::Linger);
                        entry.linger_deadline_ns =
                            now_ns + self.config.publication_linger_timeout_ns;
                        work += 1;
                    }
                }
                PublicationState::Linger => {
                    if now_ns >= entry.linger_deadline_ns {
                        to_close.push(registration_id);
                    }
                }
                PublicationState::Closed => to_close.push(registration_id),
            }
        }

        for registration_id in to_close {
            work += 1;
            if let Some(entry) = self.ipc_publications.remove(&registration_id) {
                entry.publication.shared.set_state(PublicationState::Closed);
                let now_ms = epoch_ms();
                self.counters.free(entry.publisher_limit_counter_id, now_ms);
                for counter in &entry.publication.subscriber_positions {
                    self.counters.free(counter.id(), now_ms);
                }

                // Tell every linked subscription its image is gone.
                let events: Vec<Vec<u8>> = self
                    .subscriptions
                    .values_mut()
                    .filter(|s| s.ipc_links.iter().any(|(p, _)| *p == registration_id))
                    .map(|subscription| {
                        subscription.ipc_links.retain(|(p, _)| *p != registration_id);
                        ImageUnavailableEvent {
                            correlation_id: registration_id,
                            subscription_registration_id: subscription.registration_id,
                            stream_id: entry.publication.shared.stream_id,
                        }
                        .encode()
                    })
                    .collect();
                for event in events {
                    self.transmit(event_type::ON_UNAVAILABLE_IMAGE, &event);
                }
                tracing::info!(registration_id, "ipc publication closed");
            }
        }
        work
    }

    fn check_images(&mut self, now_ns: i64) -> usize {
        let mut work = 0;
        let liveness_timeout = self.config.image_liveness_timeout_ns;

        let stale: Vec<i64> = self
            .images
            .iter()
            .filter(|(_, entry)| {
                entry.shared.state() == ImageState::Active
                    && (now_ns
                        - entry.shared.time_of_last_packet_ns.load(Ordering::Acquire)
                        > liveness_timeout
                        || entry.shared.end_of_stream_reached())
            })
            .map(|(&id, _)| id)
            .collect();
        for image_id in stale {
            work += 1;
            self.begin_image_drain(image_id, now_ns);
        }

        let expired: Vec<i64> = self
            .images
            .iter()
            .filter(|(_, entry)| {
                entry.shared.state() != ImageState::Active && now_ns >= entry.linger_deadline_ns
            })
            .map(|(&id, _)| id)
            .collect();
        for image_id in expired {
            work += 1;
            self.close_image(image_id);
        }
        work
    }

    fn begin_image_drain(&mut self, image_id: i64, now_ns: i64) {
        let Some(entry) = self.images.get_mut(&image_id) else { return };
        if entry.shared.state() != ImageState::Active {
            return;
        }
        entry.shared.set_state(ImageState::Draining);
        entry.linger_deadline_ns = now_ns + self.config.image_liveness_timeout_ns;

        let events: Vec<Vec<u8>> = entry
            .subscription_ids
            .iter()
            .map(|&subscription_id| {
                ImageUnavailableEvent {
                    correlation_id: entry.shared.correlation_id,
                    subscription_registration_id: subscription_id,
                    stream_id: entry.shared.stream_id,
                }
                .encode()
            })
            .collect();
        for event in events {
            self.transmit(event_type::ON_UNAVAILABLE_IMAGE, &event);
        }
        tracing::debug!(image_id, "image draining");
    }

    fn close_image(&mut self, image_id: i64) {
        let Some(entry) = self.images.remove(&image_id) else { return };
        entry.shared.set_state(ImageState::Closed);
        let _ = self
            .receiver_proxy
            .offer(ReceiverCmd::RemoveImage { correlation_id: image_id });
        let now_ms = epoch_ms();
        for counter_id in entry.counter_ids {
            self.counters.free(counter_id, now_ms);
        }
        tracing::debug!(image_id, "image closed");
    }
}

/// Unreferenced publication begins its wind-down: freeze the producer
/// limit and stamp the end-of-stream position.
fn begin_network_drain(entry: &mut NetworkPublicationEntry, now_ns: i64) {
    let eos = entry.shared.producer_position();
    entry.shared.log.meta().signal_end_of_stream(eos);
    entry.shared.set_state(PublicationState::Draining);
    entry.linger_deadline_ns = now_ns + 5 * TIMER_INTERVAL_NS;
    tracing::debug!(
        registration_id = entry.shared.registration_id,
        eos,
        "network publication draining"
    );
}

fn begin_ipc_drain(entry: &mut IpcPublicationEntry, now_ns: i64) {
    let eos = entry.publication.shared.producer_position();
    entry.publication.shared.log.meta().signal_end_of_stream(eos);
    entry.publication.shared.set_state(PublicationState::Draining);
    entry.linger_deadline_ns = now_ns + 5 * TIMER_INTERVAL_NS;
    tracing::debug!(
        registration_id = entry.publication.shared.registration_id,
        eos,
        "ipc publication draining"
    );
}

/// Detect a consumer blocked behind a dead claim and pad over it.
#[allow(clippy::too_many_arguments)]
fn check_publication_unblock(
    shared: &PublicationShared,
    last_consumer_position: &mut i64,
    time_of_last_change_ns: &mut i64,
    consumed_position: i64,
    unblock_timeout_ns: i64,
    now_ns: i64,
    system: &SystemCounters,
) -> usize {
    let producer_position = shared.producer_position();

    if consumed_position != *last_consumer_position || consumed_position >= producer_position {
        *last_consumer_position = consumed_position;
        *time_of_last_change_ns = now_ns;
        return 0;
    }
    if now_ns - *time_of_last_change_ns < unblock_timeout_ns {
        return 0;
    }

    let bits = shared.position_bits_to_shift;
    let term_id = compute_term_id_from_position(consumed_position, bits, shared.initial_term_id);
    let term_count = term_id.wrapping_sub(shared.initial_term_id);
    let blocked_offset = compute_term_offset_from_position(consumed_position, bits) as usize;
    let term = shared.log.term(layout::index_by_term_count(term_count));

    // Tail within the blocked term: the whole term when the producer has
    // moved on.
    let producer_term_id =
        compute_term_id_from_position(producer_position, bits, shared.initial_term_id);
    let tail_offset = if producer_term_id == term_id {
        compute_term_offset_from_position(producer_position, bits) as usize
    } else {
        shared.term_length
    };

    match unblocker::unblock(
        term,
        shared.session_id,
        shared.stream_id,
        term_id,
        blocked_offset,
        tail_offset,
        true,
    ) {
        UnblockStatus::Unblocked | UnblockStatus::UnblockedToEnd => {
            tracing::warn!(
                registration_id = shared.registration_id,
                position = consumed_position,
                "publication unblocked past dead claim"
            );
            system.get(SystemCounterId::UnblockedPublications).increment();
            *time_of_last_change_ns = now_ns;
            1
        }
        UnblockStatus::NoAction => {
            *time_of_last_change_ns = now_ns;
            0
        }
    }
}

impl Agent for DriverConductor {
    fn role_name(&self) -> &'static str {
        "conductor"
    }

    fn do_work(&mut self) -> io::Result<usize> {
        let now_ns = nano_time();
        let mut work = 0;

        // Client commands: copy out of the ring, then process, so the ring
        // read borrow does not overlap registry mutation.
        let mut scratch = std::mem::take(&mut self.command_scratch);
        scratch.clear();
        self.command_ring.read(
            |msg_type, payload| scratch.push((msg_type, payload.to_vec())),
            COMMAND_LIMIT,
        );
        for (msg_type, payload) in &scratch {
            self.on_client_command(*msg_type, payload, now_ns);
            work += 1;
        }
        self.command_scratch = scratch;

        // Receiver requests.
        let queue = Arc::clone(&self.conductor_queue);
        while let Some(cmd) = queue.poll() {
            self.on_create_image(cmd);
            work += 1;
        }

        if now_ns - self.last_timer_check_ns >= TIMER_INTERVAL_NS {
            self.last_timer_check_ns = now_ns;
            self.command_ring.set_consumer_heartbeat_time(epoch_ms());
            work += self.on_timer_check(now_ns);
        }

        Ok(work)
    }

    fn on_close(&mut self) {
        let ids: Vec<i64> = self.images.keys().copied().collect();
        for image_id in ids {
            self.close_image(image_id);
        }
        let ids: Vec<i64> = self.network_publications.keys().copied().collect();
        for registration_id in ids {
            self.close_network_publication(registration_id);
        }
        self.ipc_publications.clear();
        self.subscriptions.clear();
        tracing::debug!("conductor closed");
    }
}
