//! # Error Handling
//!
//! This module defines the error type shared by every part of the streaming bridge.
//!
//! ## Error Categories:
//! - **Decode**: A frame from either socket could not be parsed (bad JSON or base64)
//! - **UnsupportedEncoding / InvalidSampleRate**: The telephony side announced an audio format we can't decode
//! - **Connection**: The realtime AI socket failed to open, failed to send, or dropped
//! - **AckTimeout**: The AI service never acknowledged our session configuration
//! - **Teardown**: One or more cleanup steps failed while closing a session
//! - **SessionNotFound / CapacityExceeded**: Registry lookups and limits
//! - **Config**: Invalid configuration values
//!
//! ## Which errors are fatal:
//! Only `Connection` during session start ends a call. Everything else is logged
//! by the caller and the stream keeps running.
//!
//! ## Rust Concepts:
//! - **enum with data**: Each variant carries the context needed for a useful log line
//! - **Display trait**: Human-readable formatting used by `tracing` fields (`%err`)
//! - **From trait**: Lets `?` convert library errors into `BridgeError` automatically

use std::fmt;
use std::time::Duration;

/// Errors raised by the bridge, codec, and realtime client.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// A JSON or base64 payload could not be decoded
    Decode(String),

    /// Audio encoding tag outside the supported set
    UnsupportedEncoding(String),

    /// Sample rate outside 1..=192000 Hz
    InvalidSampleRate(u32),

    /// Realtime AI connection could not be opened or was lost
    Connection(String),

    /// Configuration update was not acknowledged within the bound
    AckTimeout(Duration),

    /// Cleanup steps that failed during session teardown
    Teardown(String),

    /// No session registered under this stream id
    SessionNotFound(String),

    /// Registry is full
    CapacityExceeded(usize),

    /// Invalid configuration value
    Config(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Decode(msg) => write!(f, "Decode error: {}", msg),
            BridgeError::UnsupportedEncoding(encoding) => {
                write!(f, "Unsupported audio encoding: {}", encoding)
            }
            BridgeError::InvalidSampleRate(rate) => write!(f, "Invalid sample rate: {} Hz", rate),
            BridgeError::Connection(msg) => write!(f, "Realtime connection error: {}", msg),
            BridgeError::AckTimeout(waited) => write!(
                f,
                "Session configuration not acknowledged within {}ms",
                waited.as_millis()
            ),
            BridgeError::Teardown(msg) => write!(f, "Teardown error: {}", msg),
            BridgeError::SessionNotFound(stream_id) => {
                write!(f, "No active session for stream {}", stream_id)
            }
            BridgeError::CapacityExceeded(max) => {
                write!(f, "Maximum concurrent sessions ({}) reached", max)
            }
            BridgeError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Malformed JSON on either socket.
impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Decode(format!("invalid JSON: {}", err))
    }
}

/// Malformed base64 audio payloads.
impl From<base64::DecodeError> for BridgeError {
    fn from(err: base64::DecodeError) -> Self {
        BridgeError::Decode(format!("invalid base64: {}", err))
    }
}

/// Any WebSocket-level failure on the realtime side is a connection problem.
impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::Connection(err.to_string())
    }
}

/// Type alias for Results that use the bridge error type.
pub type BridgeResult<T> = Result<T, BridgeError>;
