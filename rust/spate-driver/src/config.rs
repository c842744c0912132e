//! Driver configuration.
//!
//! A plain struct with validated defaults, overridable from the
//! environment. Every duration is nanoseconds; env values accept a bare
//! integer (ns) or an `us`/`ms`/`s` suffix.

use std::path::PathBuf;
use std::time::Duration;

use spate_logbuffer::layout::check_term_length;
use spate_proto::DATA_HEADER_LENGTH;

use crate::error::DriverError;

/// How the three agents map onto threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingMode {
    /// Conductor, sender and receiver each on their own thread.
    Dedicated,
    /// Conductor on one thread, sender + receiver sharing another.
    SharedNetwork,
    /// All three agents on a single thread.
    Shared,
    /// No threads; the embedding caller invokes the duty cycle.
    Invoker,
}

/// Idle strategy applied when an agent's work count is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategyKind {
    BusySpin,
    Yielding,
    Backoff,
    Sleeping(Duration),
}

/// Flow control strategy selection for network publications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlStrategy {
    /// Unicast: track the single receiver's consumption + window.
    UnicastMax,
    /// Multicast: minimum over all tracked receivers; an empty receiver
    /// set falls back to the sender window (optimistic).
    MulticastMin,
    /// As `MulticastMin` but requires at least `group_size` receivers
    /// before any data may be sent.
    MulticastMinGroup { group_size: usize },
}

/// Congestion control strategy selection for images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionControlStrategy {
    StaticWindow,
    Cubic,
}

/// The full driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Directory holding `cnc.dat` and the log buffer files.
    pub dir: PathBuf,
    /// Delete and recreate the directory on launch.
    pub dir_delete_on_start: bool,

    pub term_buffer_length: usize,
    pub ipc_term_buffer_length: usize,
    pub mtu_length: usize,
    pub initial_window_length: usize,
    pub socket_rcvbuf: usize,
    pub socket_sndbuf: usize,
    pub file_page_size: usize,
    pub pre_touch_mapped_memory: bool,

    pub to_driver_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counters_values_buffer_length: usize,
    pub error_buffer_length: usize,
    pub loss_report_buffer_length: usize,

    pub status_message_timeout_ns: i64,
    pub client_liveness_timeout_ns: i64,
    pub image_liveness_timeout_ns: i64,
    pub publication_linger_timeout_ns: i64,
    pub publication_unblock_timeout_ns: i64,
    pub heartbeat_interval_ns: i64,
    pub counter_free_to_reuse_timeout_ms: i64,
    pub flow_control_receiver_timeout_ns: i64,

    pub flow_control: FlowControlStrategy,
    pub congestion_control: CongestionControlStrategy,

    pub nak_unicast_delay_ns: i64,
    pub nak_multicast_group_size: usize,
    pub nak_multicast_max_backoff_ns: i64,
    pub retransmit_unicast_delay_ns: i64,
    pub retransmit_unicast_linger_ns: i64,
    pub max_retransmits: usize,

    pub threading_mode: ThreadingMode,
    pub conductor_idle: IdleStrategyKind,
    pub sender_idle: IdleStrategyKind,
    pub receiver_idle: IdleStrategyKind,
    pub shared_idle: IdleStrategyKind,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            dir_delete_on_start: false,

            term_buffer_length: 16 * 1024 * 1024,
            ipc_term_buffer_length: 16 * 1024 * 1024,
            mtu_length: 1408,
            initial_window_length: 128 * 1024,
            socket_rcvbuf: 128 * 1024,
            socket_sndbuf: 128 * 1024,
            file_page_size: 4096,
            pre_touch_mapped_memory: false,

            to_driver_buffer_length: 1024 * 1024,
            to_clients_buffer_length: 1024 * 1024,
            counters_values_buffer_length: 1024 * 1024,
            error_buffer_length: 1024 * 1024,
            loss_report_buffer_length: 1024 * 1024,

            status_message_timeout_ns: ms(200),
            client_liveness_timeout_ns: s(10),
            image_liveness_timeout_ns: s(10),
            publication_linger_timeout_ns: s(5),
            publication_unblock_timeout_ns: s(15),
            heartbeat_interval_ns: ms(100),
            counter_free_to_reuse_timeout_ms: 1000,
            flow_control_receiver_timeout_ns: s(5),

            flow_control: FlowControlStrategy::UnicastMax,
            congestion_control: CongestionControlStrategy::StaticWindow,

            nak_unicast_delay_ns: ms(60),
            nak_multicast_group_size: 10,
            nak_multicast_max_backoff_ns: ms(60),
            retransmit_unicast_delay_ns: 0,
            retransmit_unicast_linger_ns: ms(60),
            max_retransmits: 16,

            threading_mode: ThreadingMode::Dedicated,
            conductor_idle: IdleStrategyKind::Backoff,
            sender_idle: IdleStrategyKind::Backoff,
            receiver_idle: IdleStrategyKind::Backoff,
            shared_idle: IdleStrategyKind::Backoff,
        }
    }
}

const fn ms(v: i64) -> i64 {
    v * 1_000_000
}

const fn s(v: i64) -> i64 {
    v * 1_000_000_000
}

fn default_dir() -> PathBuf {
    let base = if cfg!(target_os = "linux") && std::path::Path::new("/dev/shm").is_dir() {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir()
    };
    let user = std::env::var("USER").unwrap_or_else(|_| "default".to_string());
    base.join(format!("spate-{user}"))
}

impl DriverConfig {
    /// Read overrides from the environment on top of the defaults.
    pub fn from_env() -> Result<Self, DriverError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("SPATE_DIR") {
            config.dir = PathBuf::from(dir);
        }
        if let Ok(v) = std::env::var("SPATE_DIR_DELETE_ON_START") {
            config.dir_delete_on_start = v == "true" || v == "1";
        }

        read_size("SPATE_TERM_BUFFER_LENGTH", &mut config.term_buffer_length)?;
        read_size("SPATE_IPC_TERM_BUFFER_LENGTH", &mut config.ipc_term_buffer_length)?;
        read_size("SPATE_MTU_LENGTH", &mut config.mtu_length)?;
        read_size("SPATE_INITIAL_WINDOW_LENGTH", &mut config.initial_window_length)?;
        read_size("SPATE_SOCKET_RCVBUF", &mut config.socket_rcvbuf)?;
        read_size("SPATE_SOCKET_SNDBUF", &mut config.socket_sndbuf)?;

        read_duration("SPATE_STATUS_MESSAGE_TIMEOUT", &mut config.status_message_timeout_ns)?;
        read_duration("SPATE_CLIENT_LIVENESS_TIMEOUT", &mut config.client_liveness_timeout_ns)?;
        read_duration("SPATE_IMAGE_LIVENESS_TIMEOUT", &mut config.image_liveness_timeout_ns)?;
        read_duration(
            "SPATE_PUBLICATION_LINGER_TIMEOUT",
            &mut config.publication_linger_timeout_ns,
        )?;
        read_duration(
            "SPATE_PUBLICATION_UNBLOCK_TIMEOUT",
            &mut config.publication_unblock_timeout_ns,
        )?;
        read_duration("SPATE_NAK_UNICAST_DELAY", &mut config.nak_unicast_delay_ns)?;
        read_duration(
            "SPATE_NAK_MULTICAST_MAX_BACKOFF",
            &mut config.nak_multicast_max_backoff_ns,
        )?;
        read_duration(
            "SPATE_RETRANSMIT_UNICAST_DELAY",
            &mut config.retransmit_unicast_delay_ns,
        )?;
        read_duration(
            "SPATE_RETRANSMIT_UNICAST_LINGER",
            &mut config.retransmit_unicast_linger_ns,
        )?;

        if let Ok(v) = std::env::var("SPATE_NAK_MULTICAST_GROUP_SIZE") {
            config.nak_multicast_group_size = v
                .parse()
                .map_err(|_| DriverError::Config(format!("bad group size: {v}")))?;
        }

        if let Ok(v) = std::env::var("SPATE_FLOW_CONTROL_STRATEGY") {
            config.flow_control = parse_flow_control(&v, config.nak_multicast_group_size)?;
        }
        if let Ok(v) = std::env::var("SPATE_CONGESTION_CONTROL_STRATEGY") {
            config.congestion_control = match v.as_str() {
                "static-window" => CongestionControlStrategy::StaticWindow,
                "cubic" => CongestionControlStrategy::Cubic,
                other => {
                    return Err(DriverError::Config(format!(
                        "unknown congestion control strategy: {other}"
                    )))
                }
            };
        }

        if let Ok(v) = std::env::var("SPATE_THREADING_MODE") {
            config.threading_mode = match v.as_str() {
                "dedicated" => ThreadingMode::Dedicated,
                "shared-network" => ThreadingMode::SharedNetwork,
                "shared" => ThreadingMode::Shared,
                "invoker" => ThreadingMode::Invoker,
                other => {
                    return Err(DriverError::Config(format!("unknown threading mode: {other}")))
                }
            };
        }

        read_idle("SPATE_CONDUCTOR_IDLE_STRATEGY", &mut config.conductor_idle)?;
        read_idle("SPATE_SENDER_IDLE_STRATEGY", &mut config.sender_idle)?;
        read_idle("SPATE_RECEIVER_IDLE_STRATEGY", &mut config.receiver_idle)?;
        read_idle("SPATE_SHARED_IDLE_STRATEGY", &mut config.shared_idle)?;

        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints.
    pub fn validate(&self) -> Result<(), DriverError> {
        check_term_length(self.term_buffer_length)
            .map_err(|e| DriverError::Config(format!("term-buffer-length: {e}")))?;
        check_term_length(self.ipc_term_buffer_length)
            .map_err(|e| DriverError::Config(format!("ipc-term-buffer-length: {e}")))?;

        if self.mtu_length % 32 != 0 {
            return Err(DriverError::Config("mtu-length must be a multiple of 32".into()));
        }
        if self.mtu_length < DATA_HEADER_LENGTH + 32 {
            return Err(DriverError::Config("mtu-length too small for a frame".into()));
        }
        if self.mtu_length > 8192 {
            return Err(DriverError::Config("mtu-length must be <= 8192".into()));
        }
        if self.initial_window_length > self.term_buffer_length / 2 {
            return Err(DriverError::Config(
                "initial-window-length must be <= half the term length".into(),
            ));
        }
        if self.max_retransmits == 0 {
            return Err(DriverError::Config("max-retransmits must be > 0".into()));
        }
        Ok(())
    }

    /// Flow-control window for a publication: half the term, floor one MTU.
    pub fn term_window_length(&self, term_length: usize) -> usize {
        (term_length / 2).max(self.mtu_length)
    }

    /// Max payload per unfragmented frame.
    pub fn max_payload(&self) -> usize {
        self.mtu_length - DATA_HEADER_LENGTH
    }
}

fn parse_flow_control(
    value: &str,
    group_size: usize,
) -> Result<FlowControlStrategy, DriverError> {
    match value {
        "unicast-max" => Ok(FlowControlStrategy::UnicastMax),
        "multicast-min" => Ok(FlowControlStrategy::MulticastMin),
        "multicast-min-group" => Ok(FlowControlStrategy::MulticastMinGroup { group_size }),
        other => Err(DriverError::Config(format!("unknown flow control strategy: {other}"))),
    }
}

fn read_size(key: &str, out: &mut usize) -> Result<(), DriverError> {
    if let Ok(v) = std::env::var(key) {
        *out = parse_size(&v).ok_or_else(|| DriverError::Config(format!("{key}: bad size {v}")))?;
    }
    Ok(())
}

fn read_duration(key: &str, out: &mut i64) -> Result<(), DriverError> {
    if let Ok(v) = std::env::var(key) {
        *out = parse_duration_ns(&v)
            .ok_or_else(|| DriverError::Config(format!("{key}: bad duration {v}")))?;
    }
    Ok(())
}

fn read_idle(key: &str, out: &mut IdleStrategyKind) -> Result<(), DriverError> {
    if let Ok(v) = std::env::var(key) {
        *out = match v.as_str() {
            "busy-spin" => IdleStrategyKind::BusySpin,
            "yield" => IdleStrategyKind::Yielding,
            "backoff" => IdleStrategyKind::Backoff,
            other => {
                if let Some(millis) = other.strip_prefix("sleep:") {
                    let millis: u64 = millis
                        .parse()
                        .map_err(|_| DriverError::Config(format!("{key}: bad sleep {other}")))?;
                    IdleStrategyKind::Sleeping(Duration::from_millis(millis))
                } else {
                    return Err(DriverError::Config(format!("{key}: unknown strategy {other}")));
                }
            }
        };
    }
    Ok(())
}

/// `65536`, `64k`, `16m`, `1g`.
pub(crate) fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.as_bytes().last()? {
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok().map(|v| v * multiplier)
}

/// `1000` (ns), `100us`, `10ms`, `5s`.
fn parse_duration_ns(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Some(v) = value.strip_suffix("ms") {
        return v.parse::<i64>().ok().map(ms);
    }
    if let Some(v) = value.strip_suffix("us") {
        return v.parse::<i64>().ok().map(|v| v * 1000);
    }
    if let Some(v) = value.strip_suffix('s') {
        return v.parse::<i64>().ok().map(s);
    }
    value.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("65536"), Some(65536));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("16M"), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("nope"), None);
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration_ns("1000"), Some(1000));
        assert_eq!(parse_duration_ns("100us"), Some(100_000));
        assert_eq!(parse_duration_ns("10ms"), Some(10_000_000));
        assert_eq!(parse_duration_ns("5s"), Some(5_000_000_000));
    }

    #[test]
    fn bad_mtu_rejected() {
        let mut config = DriverConfig::default();
        config.mtu_length = 1400; // not 32-aligned
        assert!(config.validate().is_err());

        config.mtu_length = 16384;
        assert!(config.validate().is_err());
    }

    #[test]
    fn window_bounded_by_term() {
        let mut config = DriverConfig::default();
        config.term_buffer_length = 64 * 1024;
        config.initial_window_length = 64 * 1024;
        assert!(config.validate().is_err());

        config.initial_window_length = 32 * 1024;
        assert!(config.validate().is_ok());
    }
}
