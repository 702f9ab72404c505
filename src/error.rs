//! # Error Types
//!
//! Every fallible operation in the runtime returns [`ProtocolError`].
//!
//! ## Error Categories
//! - **Transport**: bind/accept/dial failures, TLS and WebSocket handshake errors,
//!   closed connections and elapsed deadlines
//! - **Framing**: short reads, malformed headers, oversized bodies
//! - **Routing**: message types with no internal route and no outbound opcode
//! - **Validation**: unauthenticated sessions hitting gated routes, bad identities
//! - **Configuration**: unknown transports, opcode coercion failures
//!
//! Handler panics never escape a task boundary; they are reported as
//! [`ProtocolError::HandlerPanic`] in logs.
//!
//! ## Example Usage
//! ```rust
//! use gamenet::error::{ProtocolError, Result};
//! use gamenet::protocol::opcode::RawOpcode;
//!
//! fn coerce(raw: i64) -> Result<u16> {
//!     RawOpcode::from(raw).narrow()
//! }
//!
//! assert!(matches!(coerce(0), Err(ProtocolError::ReservedOpcode)));
//! assert_eq!(coerce(42).unwrap(), 42);
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    pub const ERR_ROUTER_WRITE_LOCK: &str = "Failed to acquire write lock on router";
    pub const ERR_REGISTRY_STOPPED: &str = "Session registry coordinator has stopped";
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Packet body too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("No route registered for message type {0}")]
    NotRegistered(&'static str),

    #[error("Session is not authenticated")]
    SessionInvalid,

    #[error("Session already authenticated as user {0}")]
    AlreadyAuthenticated(u64),

    #[error("User identity 0 is reserved for unauthenticated sessions")]
    InvalidIdentity,

    #[error("Opcode 0 is reserved")]
    ReservedOpcode,

    #[error("Opcode {0} does not fit in 16 bits")]
    OpcodeOutOfRange(String),

    #[error("Unsupported opcode kind: {0}")]
    UnsupportedOpcodeKind(String),

    #[error("Packet lease {0} returned to the pool twice")]
    DoubleFree(u64),

    #[error("Handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// True for errors that mean the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed | ProtocolError::ListenerClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
