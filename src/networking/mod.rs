//! LLUDP circuit implementation tunneled over a message-oriented transport
//!
//! This module provides the message template codec (primitive readers/writers and
//! the template-driven serializer), the circuit protocol engine (framing, acks,
//! retransmission, keepalive, reconnection) and the async driver applications use.

pub mod circuit;
pub mod client;
pub mod packets;
pub mod serialization;
pub mod transport;

// Re-export main types for convenience
pub use circuit::{
    Acknowledgement, Circuit, CircuitAction, CircuitState, CircuitStats, CloseNotice,
};
pub use client::Client;
pub use packets::{
    BlockTemplate, Frequency, MessageBlocks, MessageBuilder, MessageTemplate, Quantity, Record,
    Value, VariableTemplate, VariableType, WireMessage,
};
pub use serialization::{MessageCatalogue, TemplateCodec};
pub use transport::{close_code, Frame, Transport, TransportEvent, TransportSink, WebSocketTransport};

// Error types
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum NetworkError {
    #[error("Unknown message type: {name}")]
    UnknownMessageType { name: String },

    #[error("Unknown message number {number} ({frequency:?})")]
    UnknownMessageNumber { frequency: Frequency, number: u32 },

    #[error("Block {block} expects {expected} instance(s), got {actual}")]
    QuantityMismatch { block: String, expected: usize, actual: usize },

    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    #[error("Invalid value for {variable}: {reason}")]
    InvalidValue { variable: String, reason: String },

    #[error("Reliable packet {sequence} was never acknowledged")]
    Timeout { sequence: u32 },

    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Gave up after {attempts} reconnect attempts")]
    MaxReconnectsExceeded { attempts: u32 },

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Circuit is closed")]
    CircuitClosed,

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

impl NetworkError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        NetworkError::MalformedMessage { reason: reason.into() }
    }

    pub(crate) fn invalid(variable: &str, reason: impl Into<String>) -> Self {
        NetworkError::InvalidValue {
            variable: variable.to_string(),
            reason: reason.into(),
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Transport { reason: err.to_string() }
    }
}
