//! # rudp
//!
//! A connection-oriented, reliable, ordered, message-preserving transport
//! layered on UDP.
//!
//! ## Architecture
//!
//! - `sequence`: wrapping 32-bit sequence numbers with modular comparison
//! - `packet`: datagram encoding/decoding (6-byte header + optional ack +
//!   payload)
//! - `transmit_queue`: per-connection retransmission queue with
//!   acknowledgement-driven removal
//! - `receive_queue`: staging that pairs application reads with accepted
//!   inbound payloads
//! - `multiplexer`: shared UDP socket for all connections on one local
//!   endpoint
//! - `connection`: connection state machine and the public async operations
//! - `listener`: accept side, one per-peer connection per inbound handshake
//! - `registry`: process-wide endpoint-to-multiplexer sharing
//!
//! ## Usage
//!
//! ```ignore
//! use rudp::{Connection, Listener};
//!
//! // Accept side
//! let listener = Listener::bind("127.0.0.1:0".parse()?).await?;
//! let addr = listener.local_addr();
//! tokio::spawn(async move {
//!     let peer = listener.accept().await?;
//!     let mut buf = [0u8; 1024];
//!     let n = peer.recv(&mut buf).await?;
//!     peer.send(&buf[..n]).await?;
//!     Ok::<_, rudp::TransportError>(())
//! });
//!
//! // Connect side
//! let conn = Connection::bind("127.0.0.1:0".parse()?).await?;
//! conn.connect(addr).await?;
//! conn.send(b"hello").await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod packet;
pub mod sequence;

mod multiplexer;
mod receive_queue;
mod registry;
mod transmit_queue;

// Re-exports for convenience
pub use config::TransportConfig;
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use error::{Result, TransportError};
pub use listener::Listener;
pub use packet::{Packet, PacketKind, MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE};
pub use sequence::SequenceNumber;
