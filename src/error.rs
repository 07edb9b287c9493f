//! Error taxonomy for the peripheral link.
//!
//! None of these are fatal to the host: callers log them and carry on with
//! the last known sensor state.

use thiserror::Error;

/// Inbound frame could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Malformed frame: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Block-facing argument could not be turned into a command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid byte value: {0:?}")]
    InvalidByte(String),

    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("Empty payload")]
    EmptyPayload,
}

/// Failures surfaced by the wireless link or discovery
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Peripheral disconnected")]
    Disconnected,

    #[error("Link busy, command dropped")]
    Busy,

    #[error("Operation timed out")]
    Timeout,

    #[error("No data received for {0} ms")]
    DataStall(u64),

    #[error("GATT error: {0}")]
    Gatt(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),
}

impl From<btleplug::Error> for LinkError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::Disconnected,
            btleplug::Error::TimedOut(_) => Self::Timeout,
            btleplug::Error::DeviceNotFound => Self::NotFound("device".to_string()),
            other => Self::Gatt(other.to_string()),
        }
    }
}
