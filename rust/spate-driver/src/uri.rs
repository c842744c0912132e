//! Channel URI parsing.
//!
//! `spate:udp?endpoint=host:port|mtu=1408` / `spate:ipc`. The grammar is a
//! flat key=value list separated by `|`; only the keys below are accepted.
//! The URI is otherwise opaque to the core — semantics live with whoever
//! reads the parameter.

use std::net::SocketAddr;

use crate::error::DriverError;

/// URI scheme prefix.
pub const URI_SCHEME: &str = "spate:";

/// Accepted parameter keys.
const ACCEPTED_KEYS: &[&str] = &[
    "endpoint",
    "interface",
    "control",
    "control-mode",
    "mtu",
    "term-length",
    "init-term-id",
    "term-id",
    "term-offset",
    "ttl",
    "reliable",
    "session-id",
    "tags",
    "alias",
];

/// Transport media of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Udp,
    Ipc,
}

/// A parsed channel URI.
#[derive(Debug, Clone)]
pub struct ChannelUri {
    pub media: Media,
    params: Vec<(String, String)>,
    original: String,
}

impl ChannelUri {
    /// Parse and validate a channel URI string.
    pub fn parse(uri: &str) -> Result<Self, DriverError> {
        let rest = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| DriverError::Channel(format!("missing '{URI_SCHEME}' scheme: {uri}")))?;

        let (media_str, query) = match rest.split_once('?') {
            Some((media, query)) => (media, Some(query)),
            None => (rest, None),
        };

        let media = match media_str {
            "udp" => Media::Udp,
            "ipc" => Media::Ipc,
            other => return Err(DriverError::Channel(format!("unknown media '{other}': {uri}"))),
        };

        let mut params = Vec::new();
        if let Some(query) = query {
            for pair in query.split('|') {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| DriverError::Channel(format!("bad param '{pair}': {uri}")))?;
                if !ACCEPTED_KEYS.contains(&key) {
                    return Err(DriverError::Channel(format!("unknown param '{key}': {uri}")));
                }
                params.push((key.to_string(), value.to_string()));
            }
        }

        if media == Media::Udp && query.is_none() {
            return Err(DriverError::Channel(format!("udp channel needs params: {uri}")));
        }

        Ok(Self { media, params, original: uri.to_string() })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_udp(&self) -> bool {
        self.media == Media::Udp
    }

    pub fn is_ipc(&self) -> bool {
        self.media == Media::Ipc
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    fn socket_addr(&self, key: &str) -> Result<Option<SocketAddr>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<SocketAddr>()
                .map(Some)
                .map_err(|_| DriverError::Channel(format!("bad {key} '{value}': {}", self.original))),
        }
    }

    /// The data destination (sender) or bind address (receiver).
    pub fn endpoint(&self) -> Result<Option<SocketAddr>, DriverError> {
        self.socket_addr("endpoint")
    }

    /// Control address for multi-destination channels.
    pub fn control(&self) -> Result<Option<SocketAddr>, DriverError> {
        self.socket_addr("control")
    }

    /// Dynamic vs manual control mode; anything but "manual" is dynamic.
    pub fn is_manual_control_mode(&self) -> bool {
        self.get("control-mode") == Some("manual")
    }

    fn parse_i32(&self, key: &str) -> Result<Option<i32>, DriverError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .parse::<i32>()
                .map(Some)
                .map_err(|_| DriverError::Channel(format!("bad {key} '{value}': {}", self.original))),
        }
    }

    pub fn session_id(&self) -> Result<Option<i32>, DriverError> {
        self.parse_i32("session-id")
    }

    pub fn initial_term_id(&self) -> Result<Option<i32>, DriverError> {
        self.parse_i32("init-term-id")
    }

    pub fn ttl(&self) -> Result<Option<i32>, DriverError> {
        self.parse_i32("ttl")
    }

    pub fn mtu(&self) -> Result<Option<usize>, DriverError> {
        Ok(self.parse_i32("mtu")?.map(|v| v as usize))
    }

    pub fn term_length(&self) -> Result<Option<usize>, DriverError> {
        match self.get("term-length") {
            None => Ok(None),
            Some(value) => crate::config::parse_size(value)
                .map(Some)
                .ok_or_else(|| {
                    DriverError::Channel(format!("bad term-length '{value}': {}", self.original))
                }),
        }
    }

    /// NAK repair on loss; defaults to reliable.
    pub fn reliable(&self) -> bool {
        self.get("reliable") != Some("false")
    }

    /// Canonical form used to deduplicate channel endpoints: media plus the
    /// address-bearing params in fixed order.
    pub fn canonical_form(&self) -> String {
        match self.media {
            Media::Ipc => "spate:ipc".to_string(),
            Media::Udp => {
                let mut canonical = String::from("spate:udp?");
                for key in ["endpoint", "control", "interface"] {
                    if let Some(value) = self.get(key) {
                        canonical.push_str(key);
                        canonical.push('=');
                        canonical.push_str(value);
                        canonical.push('|');
                    }
                }
                canonical.pop();
                canonical
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_with_params() {
        let uri = ChannelUri::parse("spate:udp?endpoint=127.0.0.1:40123|mtu=1408").unwrap();
        assert!(uri.is_udp());
        assert_eq!(
            uri.endpoint().unwrap(),
            Some("127.0.0.1:40123".parse().unwrap())
        );
        assert_eq!(uri.mtu().unwrap(), Some(1408));
        assert!(uri.reliable());
    }

    #[test]
    fn parses_bare_ipc() {
        let uri = ChannelUri::parse("spate:ipc").unwrap();
        assert!(uri.is_ipc());
        assert_eq!(uri.canonical_form(), "spate:ipc");
    }

    #[test]
    fn rejects_unknown_key_and_bad_scheme() {
        assert!(ChannelUri::parse("spate:udp?bogus=1").is_err());
        assert!(ChannelUri::parse("udp://127.0.0.1:1234").is_err());
        assert!(ChannelUri::parse("spate:tcp?endpoint=a:1").is_err());
    }

    #[test]
    fn udp_without_params_rejected() {
        assert!(ChannelUri::parse("spate:udp").is_err());
    }

    #[test]
    fn unreliable_channel() {
        let uri =
            ChannelUri::parse("spate:udp?endpoint=127.0.0.1:9000|reliable=false").unwrap();
        assert!(!uri.reliable());
    }

    #[test]
    fn canonical_form_ignores_non_address_params() {
        let a = ChannelUri::parse("spate:udp?endpoint=127.0.0.1:9000|mtu=1408").unwrap();
        let b = ChannelUri::parse("spate:udp?endpoint=127.0.0.1:9000|ttl=4").unwrap();
        assert_eq!(a.canonical_form(), b.canonical_form());
    }

    #[test]
    fn session_and_term_params() {
        let uri = ChannelUri::parse(
            "spate:udp?endpoint=127.0.0.1:9000|session-id=77|init-term-id=5|term-length=64k",
        )
        .unwrap();
        assert_eq!(uri.session_id().unwrap(), Some(77));
        assert_eq!(uri.initial_term_id().unwrap(), Some(5));
        assert_eq!(uri.term_length().unwrap(), Some(64 * 1024));
    }
}
