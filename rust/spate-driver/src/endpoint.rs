//! Channel endpoints: one UDP socket multiplexing many streams.
//!
//! A send endpoint carries the publications of every stream on its
//! channel; a receive endpoint carries the dispatcher that demultiplexes
//! ingress frames to images. Endpoints are created by the conductor (so
//! socket errors surface on the originating client command) and then owned
//! by the sender or receiver.

use std::io;
use std::net::SocketAddr;

use spate_proto::{
    NakHeader, RttMeasurementHeader, StatusMessageHeader, NAK_HEADER_LENGTH, RTTM_HEADER_LENGTH,
    SM_HEADER_LENGTH, SM_SEND_SETUP_FLAG,
};

use crate::config::DriverConfig;
use crate::dispatcher::DataPacketDispatcher;
use crate::udp::{DestinationTracker, UdpChannel, UdpTransport};

/// Result of pushing a datagram at the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendResult {
    pub datagrams: usize,
    pub short_sends: usize,
}

/// Egress side: socket + destination set.
pub struct SendChannelEndpoint {
    pub endpoint_id: i64,
    pub channel: UdpChannel,
    pub transport: UdpTransport,
    pub destinations: DestinationTracker,
}

impl SendChannelEndpoint {
    pub fn new(endpoint_id: i64, channel: UdpChannel, config: &DriverConfig) -> io::Result<Self> {
        let transport = UdpTransport::for_send(&channel, config.socket_sndbuf)?;
        let destinations = DestinationTracker::new(config.flow_control_receiver_timeout_ns);
        Ok(Self { endpoint_id, channel, transport, destinations })
    }

    /// Send `buf` to every destination of this channel: the configured
    /// endpoint address, plus any tracked destinations (manual MDC).
    pub fn send(&self, buf: &[u8]) -> io::Result<SendResult> {
        let mut result = SendResult::default();

        if let Some(endpoint) = self.channel.endpoint {
            match self.transport.send_to(buf, endpoint)? {
                Some(sent) if sent == buf.len() => result.datagrams += 1,
                _ => result.short_sends += 1,
            }
        }

        let mut error = None;
        self.destinations.for_each(|addr| {
            if error.is_some() {
                return;
            }
            match self.transport.send_to(buf, addr) {
                Ok(Some(sent)) if sent == buf.len() => result.datagrams += 1,
                Ok(_) => result.short_sends += 1,
                Err(e) => error = Some(e),
            }
        });
        if let Some(e) = error {
            return Err(e);
        }
        Ok(result)
    }

    /// Receive one control frame (SM/NAK/RTTM) if queued.
    pub fn poll_control(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        self.transport.recv_from(buf)
    }
}

/// Ingress side: socket + dispatcher.
pub struct ReceiveChannelEndpoint {
    pub endpoint_id: i64,
    pub channel: UdpChannel,
    pub transport: UdpTransport,
    pub dispatcher: DataPacketDispatcher,
}

impl ReceiveChannelEndpoint {
    pub fn new(endpoint_id: i64, channel: UdpChannel, config: &DriverConfig) -> io::Result<Self> {
        let transport = UdpTransport::for_receive(&channel, config.socket_rcvbuf)?;
        Ok(Self { endpoint_id, channel, transport, dispatcher: DataPacketDispatcher::new() })
    }

    pub fn send_status_message(
        &self,
        dst: SocketAddr,
        session_id: i32,
        stream_id: i32,
        consumption_term_id: i32,
        consumption_term_offset: i32,
        receiver_window: i32,
        receiver_id: i64,
        flags: u8,
    ) -> io::Result<bool> {
        let mut buf = [0u8; SM_HEADER_LENGTH];
        StatusMessageHeader {
            flags,
            session_id,
            stream_id,
            consumption_term_id,
            consumption_term_offset,
            receiver_window,
            receiver_id,
        }
        .encode(&mut buf);
        Ok(self.transport.send_to(&buf, dst)?.is_some())
    }

    /// SM soliciting a SETUP for a stream seen before its image exists.
    pub fn send_setup_elicitation(
        &self,
        dst: SocketAddr,
        session_id: i32,
        stream_id: i32,
    ) -> io::Result<bool> {
        self.send_status_message(dst, session_id, stream_id, 0, 0, 0, 0, SM_SEND_SETUP_FLAG)
    }

    pub fn send_nak(
        &self,
        dst: SocketAddr,
        session_id: i32,
        stream_id: i32,
        term_id: i32,
        term_offset: i32,
        length: i32,
    ) -> io::Result<bool> {
        let mut buf = [0u8; NAK_HEADER_LENGTH];
        NakHeader { session_id, stream_id, term_id, term_offset, length }.encode(&mut buf);
        Ok(self.transport.send_to(&buf, dst)?.is_some())
    }

    pub fn send_rttm(
        &self,
        dst: SocketAddr,
        session_id: i32,
        stream_id: i32,
        echo_timestamp_ns: i64,
        reception_delta_ns: i64,
        receiver_id: i64,
        reply: bool,
    ) -> io::Result<bool> {
        let mut buf = [0u8; RTTM_HEADER_LENGTH];
        RttMeasurementHeader {
            flags: if reply { spate_proto::RTTM_REPLY_FLAG } else { 0 },
            session_id,
            stream_id,
            echo_timestamp_ns,
            reception_delta_ns,
            receiver_id,
        }
        .encode(&mut buf);
        Ok(self.transport.send_to(&buf, dst)?.is_some())
    }
}
