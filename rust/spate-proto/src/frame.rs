//! Frame header codecs.
//!
//! Layouts (byte offsets, all little-endian):
//!
//! ```text
//! generic prefix   0 frame_length:i32  4 version:u8  5 flags:u8  6 frame_type:u16
//! DATA / PAD       8 term_offset  12 session_id  16 stream_id  20 term_id
//!                 24 reserved_value:i64  32 payload...
//! NAK              8 session_id  12 stream_id  16 term_id  20 term_offset  24 length
//! SM               8 session_id  12 stream_id  16 consumption_term_id
//!                 20 consumption_term_offset  24 receiver_window  28 receiver_id:i64
//! SETUP            8 term_offset  12 session_id  16 stream_id  20 initial_term_id
//!                 24 active_term_id  28 term_length  32 mtu  36 ttl
//! RTTM             8 session_id  12 stream_id  16 echo_timestamp_ns:i64
//!                 24 reception_delta_ns:i64  32 receiver_id:i64
//! ERR              8 session_id  12 stream_id  16 error_code
//!                 20 error_string_length  24 error_string...
//! ```

/// Frames within term buffers are aligned to this many bytes.
pub const FRAME_ALIGNMENT: usize = 32;

/// Length of the generic prefix shared by every frame type.
pub const FRAME_HEADER_LENGTH: usize = 8;

pub const DATA_HEADER_LENGTH: usize = 32;
pub const NAK_HEADER_LENGTH: usize = 28;
pub const SM_HEADER_LENGTH: usize = 36;
pub const SETUP_HEADER_LENGTH: usize = 40;
pub const RTTM_HEADER_LENGTH: usize = 40;
pub const ERROR_HEADER_LENGTH: usize = 24;

/// Protocol version carried in every frame.
pub const CURRENT_VERSION: u8 = 1;

/// First fragment of a message.
pub const BEGIN_FLAG: u8 = 0x80;
/// Last fragment of a message.
pub const END_FLAG: u8 = 0x40;
/// A message that fits one frame carries both fragment flags.
pub const UNFRAGMENTED: u8 = BEGIN_FLAG | END_FLAG;

/// Data heartbeat flag: the publication has reached end-of-stream at this
/// frame's position.
pub const DATA_EOS_FLAG: u8 = 0x20;

/// Status message flag: the publication has reached end-of-stream.
pub const SM_EOS_FLAG: u8 = 0x01;
/// Status message flag: the receiver is soliciting a SETUP frame.
pub const SM_SEND_SETUP_FLAG: u8 = 0x80;
/// RTT measurement flag: this frame is the echo reply.
pub const RTTM_REPLY_FLAG: u8 = 0x80;

/// Frame type discriminators.
pub mod frame_type {
    pub const PAD: u16 = 0x00;
    pub const DATA: u16 = 0x01;
    pub const NAK: u16 = 0x02;
    pub const SM: u16 = 0x03;
    pub const ERR: u16 = 0x04;
    pub const SETUP: u16 = 0x05;
    pub const RTTM: u16 = 0x06;
}

/// Frame type name for diagnostics.
pub const fn frame_type_name(frame_type: u16) -> &'static str {
    match frame_type {
        frame_type::PAD => "PAD",
        frame_type::DATA => "DATA",
        frame_type::NAK => "NAK",
        frame_type::SM => "SM",
        frame_type::ERR => "ERR",
        frame_type::SETUP => "SETUP",
        frame_type::RTTM => "RTTM",
        _ => "UNKNOWN",
    }
}

/// Decode failure on an inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Datagram shorter than the header for its type.
    TooShort,
    /// `frame_length` inconsistent with the datagram.
    BadLength,
    /// Unknown frame type value.
    UnknownType(u16),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::TooShort => write!(f, "datagram too short for frame header"),
            FrameError::BadLength => write!(f, "frame length inconsistent with datagram"),
            FrameError::UnknownType(t) => write!(f, "unknown frame type 0x{t:02x}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[inline]
fn get_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
fn get_i64(buf: &[u8], off: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    i64::from_le_bytes(bytes)
}

#[inline]
fn put_i32(buf: &mut [u8], off: usize, value: i32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_i64(buf: &mut [u8], off: usize, value: i64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// The generic prefix shared by all frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
}

impl FrameHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        let header = Self {
            frame_length: get_i32(buf, 0),
            version: buf[4],
            flags: buf[5],
            frame_type: u16::from_le_bytes([buf[6], buf[7]]),
        };
        if header.frame_length < 0 || header.frame_length as usize > buf.len() {
            return Err(FrameError::BadLength);
        }
        Ok(header)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_i32(buf, 0, self.frame_length);
        buf[4] = self.version;
        buf[5] = self.flags;
        buf[6..8].copy_from_slice(&self.frame_type.to_le_bytes());
    }
}

/// DATA and PAD frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub flags: u8,
    pub frame_type: u16,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl DataHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < DATA_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        let prefix = FrameHeader::decode(buf)?;
        Ok(Self {
            frame_length: prefix.frame_length,
            flags: prefix.flags,
            frame_type: prefix.frame_type,
            term_offset: get_i32(buf, 8),
            session_id: get_i32(buf, 12),
            stream_id: get_i32(buf, 16),
            term_id: get_i32(buf, 20),
            reserved_value: get_i64(buf, 24),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        FrameHeader {
            frame_length: self.frame_length,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: self.frame_type,
        }
        .encode(buf);
        put_i32(buf, 8, self.term_offset);
        put_i32(buf, 12, self.session_id);
        put_i32(buf, 16, self.stream_id);
        put_i32(buf, 20, self.term_id);
        put_i64(buf, 24, self.reserved_value);
    }

    /// The header template stored in log-buffer metadata: a DATA prefix
    /// with zero length/offset/term, stamped per claim.
    pub fn template(session_id: i32, stream_id: i32) -> [u8; DATA_HEADER_LENGTH] {
        let mut buf = [0u8; DATA_HEADER_LENGTH];
        DataHeader {
            frame_length: 0,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset: 0,
            session_id,
            stream_id,
            term_id: 0,
            reserved_value: 0,
        }
        .encode(&mut buf);
        buf
    }
}

/// NAK: request retransmission of a term range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakHeader {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

impl NakHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < NAK_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        Ok(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            term_id: get_i32(buf, 16),
            term_offset: get_i32(buf, 20),
            length: get_i32(buf, 24),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        FrameHeader {
            frame_length: NAK_HEADER_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: frame_type::NAK,
        }
        .encode(buf);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.term_id);
        put_i32(buf, 20, self.term_offset);
        put_i32(buf, 24, self.length);
    }
}

/// SM: a receiver's consumption position and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusMessageHeader {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
}

impl StatusMessageHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < SM_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        Ok(Self {
            flags: buf[5],
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            consumption_term_id: get_i32(buf, 16),
            consumption_term_offset: get_i32(buf, 20),
            receiver_window: get_i32(buf, 24),
            receiver_id: get_i64(buf, 28),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        FrameHeader {
            frame_length: SM_HEADER_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: frame_type::SM,
        }
        .encode(buf);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.consumption_term_id);
        put_i32(buf, 20, self.consumption_term_offset);
        put_i32(buf, 24, self.receiver_window);
        put_i64(buf, 28, self.receiver_id);
    }
}

/// SETUP: a publication announcing its term layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub term_length: i32,
    pub mtu: i32,
    pub ttl: i32,
}

impl SetupHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < SETUP_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        Ok(Self {
            term_offset: get_i32(buf, 8),
            session_id: get_i32(buf, 12),
            stream_id: get_i32(buf, 16),
            initial_term_id: get_i32(buf, 20),
            active_term_id: get_i32(buf, 24),
            term_length: get_i32(buf, 28),
            mtu: get_i32(buf, 32),
            ttl: get_i32(buf, 36),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        FrameHeader {
            frame_length: SETUP_HEADER_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: frame_type::SETUP,
        }
        .encode(buf);
        put_i32(buf, 8, self.term_offset);
        put_i32(buf, 12, self.session_id);
        put_i32(buf, 16, self.stream_id);
        put_i32(buf, 20, self.initial_term_id);
        put_i32(buf, 24, self.active_term_id);
        put_i32(buf, 28, self.term_length);
        put_i32(buf, 32, self.mtu);
        put_i32(buf, 36, self.ttl);
    }
}

/// RTTM: round-trip-time measurement, request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttMeasurementHeader {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub echo_timestamp_ns: i64,
    pub reception_delta_ns: i64,
    pub receiver_id: i64,
}

impl RttMeasurementHeader {
    pub fn is_reply(&self) -> bool {
        self.flags & RTTM_REPLY_FLAG != 0
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < RTTM_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        Ok(Self {
            flags: buf[5],
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            echo_timestamp_ns: get_i64(buf, 16),
            reception_delta_ns: get_i64(buf, 24),
            receiver_id: get_i64(buf, 32),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        FrameHeader {
            frame_length: RTTM_HEADER_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: frame_type::RTTM,
        }
        .encode(buf);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i64(buf, 16, self.echo_timestamp_ns);
        put_i64(buf, 24, self.reception_delta_ns);
        put_i64(buf, 32, self.receiver_id);
    }
}

/// ERR: a protocol-level error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorHeader {
    pub session_id: i32,
    pub stream_id: i32,
    pub error_code: i32,
    pub error_message: String,
}

impl ErrorHeader {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < ERROR_HEADER_LENGTH {
            return Err(FrameError::TooShort);
        }
        let string_length = get_i32(buf, 20).max(0) as usize;
        if ERROR_HEADER_LENGTH + string_length > buf.len() {
            return Err(FrameError::BadLength);
        }
        Ok(Self {
            session_id: get_i32(buf, 8),
            stream_id: get_i32(buf, 12),
            error_code: get_i32(buf, 16),
            error_message: String::from_utf8_lossy(
                &buf[ERROR_HEADER_LENGTH..ERROR_HEADER_LENGTH + string_length],
            )
            .into_owned(),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let message = self.error_message.as_bytes();
        let frame_length = ERROR_HEADER_LENGTH + message.len();
        FrameHeader {
            frame_length: frame_length as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: frame_type::ERR,
        }
        .encode(buf);
        put_i32(buf, 8, self.session_id);
        put_i32(buf, 12, self.stream_id);
        put_i32(buf, 16, self.error_code);
        put_i32(buf, 20, message.len() as i32);
        buf[ERROR_HEADER_LENGTH..frame_length].copy_from_slice(message);
        frame_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_roundtrip() {
        let header = DataHeader {
            frame_length: 232,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset: 4096,
            session_id: -559038737,
            stream_id: 1001,
            term_id: 17,
            reserved_value: 0x1122334455667788,
        };
        let mut buf = [0u8; 64];
        header.encode(&mut buf);
        assert_eq!(DataHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn sm_carries_eos_flag() {
        let sm = StatusMessageHeader {
            flags: SM_EOS_FLAG,
            session_id: 1,
            stream_id: 2,
            consumption_term_id: 3,
            consumption_term_offset: 64,
            receiver_window: 128 * 1024,
            receiver_id: 99,
        };
        let mut buf = [0u8; SM_HEADER_LENGTH];
        sm.encode(&mut buf);
        let decoded = StatusMessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, sm);
        assert_eq!(decoded.flags & SM_EOS_FLAG, SM_EOS_FLAG);
    }

    #[test]
    fn setup_roundtrip() {
        let setup = SetupHeader {
            term_offset: 0,
            session_id: 5,
            stream_id: 6,
            initial_term_id: 100,
            active_term_id: 102,
            term_length: 64 * 1024,
            mtu: 1408,
            ttl: 8,
        };
        let mut buf = [0u8; SETUP_HEADER_LENGTH];
        setup.encode(&mut buf);
        assert_eq!(SetupHeader::decode(&buf).unwrap(), setup);
    }

    #[test]
    fn rttm_reply_flag() {
        let rttm = RttMeasurementHeader {
            flags: RTTM_REPLY_FLAG,
            session_id: 1,
            stream_id: 2,
            echo_timestamp_ns: 1_000_000,
            reception_delta_ns: 2500,
            receiver_id: 7,
        };
        let mut buf = [0u8; RTTM_HEADER_LENGTH];
        rttm.encode(&mut buf);
        assert!(RttMeasurementHeader::decode(&buf).unwrap().is_reply());
    }

    #[test]
    fn error_frame_carries_message() {
        let err = ErrorHeader {
            session_id: 0,
            stream_id: 9,
            error_code: 3,
            error_message: "mismatched setup".to_string(),
        };
        let mut buf = [0u8; 128];
        let len = err.encode(&mut buf);
        assert_eq!(len, ERROR_HEADER_LENGTH + 16);
        assert_eq!(ErrorHeader::decode(&buf[..len]).unwrap(), err);
    }

    #[test]
    fn truncated_datagrams_are_rejected() {
        assert_eq!(DataHeader::decode(&[0u8; 16]), Err(FrameError::TooShort));
        assert_eq!(NakHeader::decode(&[0u8; 8]), Err(FrameError::TooShort));
    }

    #[test]
    fn frame_length_must_fit_datagram() {
        let mut buf = [0u8; 32];
        DataHeader {
            frame_length: 4096,
            flags: UNFRAGMENTED,
            frame_type: frame_type::DATA,
            term_offset: 0,
            session_id: 0,
            stream_id: 0,
            term_id: 0,
            reserved_value: 0,
        }
        .encode(&mut buf);
        assert_eq!(FrameHeader::decode(&buf), Err(FrameError::BadLength));
    }
}
