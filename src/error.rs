//! Typed errors for the transport
//!
//! Errors reach the application only through operation results. Inbound
//! datagrams that fail to parse are logged and dropped, never surfaced here.

use std::io;
use thiserror::Error;

/// Errors reported by connection and listener operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation requires a bound local endpoint, or an argument was
    /// out of range (empty payload, payload above the datagram limit,
    /// non-numeric service).
    #[error("invalid argument or unbound socket")]
    InvalidArgument,

    /// Send or receive was invoked on a connection with no peer.
    #[error("socket is not connected")]
    NotConnected,

    /// Connect was invoked on an established connection, or a connection
    /// to that remote endpoint already shares this local endpoint.
    #[error("socket is already connected")]
    AlreadyConnected,

    /// Connect was invoked while a previous attempt is still in progress.
    #[error("connection attempt already in progress")]
    AlreadyStarted,

    /// The operation was aborted by closing the connection.
    #[error("operation cancelled")]
    Cancelled,

    /// Name resolution produced no candidate endpoints.
    #[error("no resolved endpoint responded")]
    Unreachable,

    /// A lower-layer socket error.
    #[error("substrate error: {0}")]
    Substrate(#[from] io::Error),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
