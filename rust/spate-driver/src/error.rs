//! Driver error type.

use std::io;

/// Error codes carried in `ON_ERROR` events and the distinct error log.
pub mod error_code {
    pub const GENERIC: i32 = 0;
    pub const INVALID_CHANNEL: i32 = 1;
    pub const UNKNOWN_SUBSCRIPTION: i32 = 2;
    pub const UNKNOWN_PUBLICATION: i32 = 3;
    pub const CHANNEL_ENDPOINT: i32 = 4;
    pub const UNKNOWN_COUNTER: i32 = 5;
    pub const UNKNOWN_COMMAND: i32 = 6;
    pub const MALFORMED_COMMAND: i32 = 7;
    pub const STORAGE_SPACE: i32 = 8;
    pub const CLIENT_TIMEOUT: i32 = 9;
    pub const PROTOCOL: i32 = 10;
    pub const BACK_PRESSURE: i32 = 11;
}

/// Errors raised inside the driver.
#[derive(Debug)]
pub enum DriverError {
    /// Invalid configuration value; fatal at startup, reported with a
    /// correlation id at runtime.
    Config(String),
    /// Malformed or unacceptable channel URI.
    Channel(String),
    /// OS-level failure (socket, mmap, file).
    Io(io::Error),
    /// A malformed or unknown client command.
    Command(String),
    /// Could not publish to a client-facing buffer after bounded retries.
    BackPressure,
}

impl DriverError {
    /// Code for the client-facing `ON_ERROR` event.
    pub fn code(&self) -> i32 {
        match self {
            DriverError::Config(_) => error_code::GENERIC,
            DriverError::Channel(_) => error_code::INVALID_CHANNEL,
            DriverError::Io(_) => error_code::CHANNEL_ENDPOINT,
            DriverError::Command(_) => error_code::MALFORMED_COMMAND,
            DriverError::BackPressure => error_code::BACK_PRESSURE,
        }
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Config(msg) => write!(f, "configuration: {msg}"),
            DriverError::Channel(msg) => write!(f, "channel: {msg}"),
            DriverError::Io(e) => write!(f, "io: {e}"),
            DriverError::Command(msg) => write!(f, "command: {msg}"),
            DriverError::BackPressure => write!(f, "client buffer back-pressure"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        DriverError::Io(e)
    }
}
