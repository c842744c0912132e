//! Client↔driver message codecs.
//!
//! Commands travel driver-ward on the MPSC command ring; events travel
//! client-ward on the broadcast buffer. Records are flat little-endian
//! encodings; strings are `[length: i32][utf-8 bytes]`. The ring record's
//! `msg_type` carries the command/event type, so the payloads here carry
//! only their fields.

use crate::error::DriverError;

/// Command types (client → driver).
pub mod command_type {
    pub const ADD_PUBLICATION: i32 = 0x01;
    pub const REMOVE_PUBLICATION: i32 = 0x02;
    pub const ADD_SUBSCRIPTION: i32 = 0x04;
    pub const REMOVE_SUBSCRIPTION: i32 = 0x05;
    pub const CLIENT_KEEPALIVE: i32 = 0x06;
    pub const ADD_COUNTER: i32 = 0x07;
    pub const REMOVE_COUNTER: i32 = 0x08;
    pub const ADD_DESTINATION: i32 = 0x09;
    pub const REMOVE_DESTINATION: i32 = 0x0A;
    pub const CLIENT_CLOSE: i32 = 0x0B;
}

/// Event types (driver → clients).
pub mod event_type {
    pub const ON_ERROR: i32 = 0x0F01;
    pub const ON_OPERATION_SUCCESS: i32 = 0x0F02;
    pub const ON_PUBLICATION_READY: i32 = 0x0F03;
    pub const ON_SUBSCRIPTION_READY: i32 = 0x0F04;
    pub const ON_AVAILABLE_IMAGE: i32 = 0x0F05;
    pub const ON_UNAVAILABLE_IMAGE: i32 = 0x0F06;
    pub const ON_COUNTER_READY: i32 = 0x0F07;
    pub const ON_CLIENT_TIMEOUT: i32 = 0x0F08;
}

// ── codec helpers ─────────────────────────────────────────────────────────────

struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(64) }
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn string(&mut self, v: &str) -> &mut Self {
        self.i32(v.len() as i32);
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct Dec<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Dec<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DriverError> {
        if self.offset + n > self.buf.len() {
            return Err(DriverError::Command("truncated message".into()));
        }
        let slice = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32, DriverError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i64(&mut self) -> Result<i64, DriverError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, DriverError> {
        let length = self.i32()?;
        if length < 0 {
            return Err(DriverError::Command("negative string length".into()));
        }
        let bytes = self.take(length as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DriverError::Command("string is not utf-8".into()))
    }
}

// ── commands ──────────────────────────────────────────────────────────────────

/// Prefix of every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlated {
    pub client_id: i64,
    pub correlation_id: i64,
}

impl Correlated {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.client_id).i64(self.correlation_id);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self { client_id: dec.i64()?, correlation_id: dec.i64()? })
    }
}

/// ADD_PUBLICATION / ADD_SUBSCRIPTION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCommand {
    pub correlated: Correlated,
    pub stream_id: i32,
    pub channel: String,
}

impl ChannelCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i32(self.stream_id)
            .string(&self.channel);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            correlated: Correlated { client_id: dec.i64()?, correlation_id: dec.i64()? },
            stream_id: dec.i32()?,
            channel: dec.string()?,
        })
    }
}

/// REMOVE_PUBLICATION / REMOVE_SUBSCRIPTION / REMOVE_COUNTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveCommand {
    pub correlated: Correlated,
    pub registration_id: i64,
}

impl RemoveCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i64(self.registration_id);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            correlated: Correlated { client_id: dec.i64()?, correlation_id: dec.i64()? },
            registration_id: dec.i64()?,
        })
    }
}

/// ADD_COUNTER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterCommand {
    pub correlated: Correlated,
    pub type_id: i32,
    pub key: Vec<u8>,
    pub label: String,
}

impl CounterCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i32(self.type_id)
            .i32(self.key.len() as i32);
        enc.buf.extend_from_slice(&self.key);
        enc.string(&self.label);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        let correlated = Correlated { client_id: dec.i64()?, correlation_id: dec.i64()? };
        let type_id = dec.i32()?;
        let key_length = dec.i32()?;
        if key_length < 0 {
            return Err(DriverError::Command("negative key length".into()));
        }
        let key = dec.take(key_length as usize)?.to_vec();
        Ok(Self { correlated, type_id, key, label: dec.string()? })
    }
}

/// ADD_DESTINATION / REMOVE_DESTINATION.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCommand {
    pub correlated: Correlated,
    /// Publication the destination applies to.
    pub registration_id: i64,
    pub channel: String,
}

impl DestinationCommand {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlated.client_id)
            .i64(self.correlated.correlation_id)
            .i64(self.registration_id)
            .string(&self.channel);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            correlated: Correlated { client_id: dec.i64()?, correlation_id: dec.i64()? },
            registration_id: dec.i64()?,
            channel: dec.string()?,
        })
    }
}

// ── events ────────────────────────────────────────────────────────────────────

/// ON_ERROR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEvent {
    pub offending_correlation_id: i64,
    pub error_code: i32,
    pub message: String,
}

impl ErrorEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.offending_correlation_id)
            .i32(self.error_code)
            .string(&self.message);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            offending_correlation_id: dec.i64()?,
            error_code: dec.i32()?,
            message: dec.string()?,
        })
    }
}

/// ON_OPERATION_SUCCESS / ON_CLIENT_TIMEOUT (id is the client id there).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatedEvent {
    pub correlation_id: i64,
}

impl CorrelatedEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlation_id);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self { correlation_id: dec.i64()? })
    }
}

/// ON_PUBLICATION_READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationReadyEvent {
    pub correlation_id: i64,
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub position_limit_counter_id: i32,
    pub log_file: String,
}

impl PublicationReadyEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlation_id)
            .i64(self.registration_id)
            .i32(self.session_id)
            .i32(self.stream_id)
            .i32(self.position_limit_counter_id)
            .string(&self.log_file);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            correlation_id: dec.i64()?,
            registration_id: dec.i64()?,
            session_id: dec.i32()?,
            stream_id: dec.i32()?,
            position_limit_counter_id: dec.i32()?,
            log_file: dec.string()?,
        })
    }
}

/// ON_SUBSCRIPTION_READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionReadyEvent {
    pub correlation_id: i64,
}

impl SubscriptionReadyEvent {
    pub fn encode(&self) -> Vec<u8> {
        CorrelatedEvent { correlation_id: self.correlation_id }.encode()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        Ok(Self { correlation_id: CorrelatedEvent::decode(buf)?.correlation_id })
    }
}

/// ON_AVAILABLE_IMAGE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReadyEvent {
    /// The image's correlation id.
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub subscriber_position_counter_id: i32,
    pub log_file: String,
    pub source_identity: String,
}

impl ImageReadyEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlation_id)
            .i64(self.subscription_registration_id)
            .i32(self.session_id)
            .i32(self.stream_id)
            .i32(self.subscriber_position_counter_id)
            .string(&self.log_file)
            .string(&self.source_identity);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            correlation_id: dec.i64()?,
            subscription_registration_id: dec.i64()?,
            session_id: dec.i32()?,
            stream_id: dec.i32()?,
            subscriber_position_counter_id: dec.i32()?,
            log_file: dec.string()?,
            source_identity: dec.string()?,
        })
    }
}

/// ON_UNAVAILABLE_IMAGE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageUnavailableEvent {
    pub correlation_id: i64,
    pub subscription_registration_id: i64,
    pub stream_id: i32,
}

impl ImageUnavailableEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlation_id)
            .i64(self.subscription_registration_id)
            .i32(self.stream_id);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self {
            correlation_id: dec.i64()?,
            subscription_registration_id: dec.i64()?,
            stream_id: dec.i32()?,
        })
    }
}

/// ON_COUNTER_READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReadyEvent {
    pub correlation_id: i64,
    pub counter_id: i32,
}

impl CounterReadyEvent {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Enc::new();
        enc.i64(self.correlation_id).i32(self.counter_id);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DriverError> {
        let mut dec = Dec::new(buf);
        Ok(Self { correlation_id: dec.i64()?, counter_id: dec.i32()? })
    }
}
