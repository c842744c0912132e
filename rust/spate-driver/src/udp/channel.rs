//! A validated UDP channel derived from a channel URI.

use std::net::SocketAddr;

use crate::error::DriverError;
use crate::uri::ChannelUri;

/// Address-level view of a UDP channel.
#[derive(Debug, Clone)]
pub struct UdpChannel {
    /// Canonical form for endpoint deduplication.
    pub canonical: String,
    /// Data address: destination for senders, bind address for receivers.
    pub endpoint: Option<SocketAddr>,
    /// Control address for multi-destination channels.
    pub control: Option<SocketAddr>,
    /// Destinations are managed explicitly via ADD/REMOVE_DESTINATION.
    pub manual_control: bool,
    pub is_multicast: bool,
    pub ttl: i32,
    pub reliable: bool,
    /// The URI the channel was built from.
    pub uri: ChannelUri,
}

impl UdpChannel {
    pub fn from_uri(uri: &ChannelUri) -> Result<Self, DriverError> {
        if !uri.is_udp() {
            return Err(DriverError::Channel(format!(
                "not a udp channel: {}",
                uri.original()
            )));
        }

        let endpoint = uri.endpoint()?;
        let control = uri.control()?;
        let manual_control = uri.is_manual_control_mode();

        if endpoint.is_none() && control.is_none() && !manual_control {
            return Err(DriverError::Channel(format!(
                "udp channel needs endpoint, control or control-mode=manual: {}",
                uri.original()
            )));
        }

        let is_multicast = endpoint.map(|a| a.ip().is_multicast()).unwrap_or(false);
        let ttl = uri.ttl()?.unwrap_or(0);

        Ok(Self {
            canonical: uri.canonical_form(),
            endpoint,
            control,
            manual_control,
            is_multicast,
            ttl,
            reliable: uri.reliable(),
            uri: uri.clone(),
        })
    }

    /// The address a receive endpoint binds.
    pub fn bind_addr(&self) -> Result<SocketAddr, DriverError> {
        self.endpoint.ok_or_else(|| {
            DriverError::Channel(format!("no endpoint to bind: {}", self.uri.original()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_channel() {
        let uri = ChannelUri::parse("spate:udp?endpoint=127.0.0.1:40456").unwrap();
        let channel = UdpChannel::from_uri(&uri).unwrap();
        assert!(!channel.is_multicast);
        assert_eq!(channel.bind_addr().unwrap().port(), 40456);
    }

    #[test]
    fn multicast_detected() {
        let uri = ChannelUri::parse("spate:udp?endpoint=224.0.1.1:40456|ttl=4").unwrap();
        let channel = UdpChannel::from_uri(&uri).unwrap();
        assert!(channel.is_multicast);
        assert_eq!(channel.ttl, 4);
    }

    #[test]
    fn manual_control_mode_without_endpoint() {
        let uri = ChannelUri::parse("spate:udp?control-mode=manual").unwrap();
        let channel = UdpChannel::from_uri(&uri).unwrap();
        assert!(channel.manual_control);
        assert!(channel.endpoint.is_none());
    }
}
