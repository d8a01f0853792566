//! Transport configuration

use std::time::Duration;

use crate::packet::MAX_PAYLOAD_SIZE;

/// Tunables shared by connections and listeners.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long an unacknowledged frame stays on the wire before it is
    /// re-sent. Reset on every retransmission; no backoff.
    pub retransmit_timeout: Duration,

    /// Upper bound on a single message payload. Messages are never
    /// fragmented; larger sends are rejected.
    pub max_payload_size: usize,

    /// Capacity of the per-connection inbound routing channel.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: Duration::from_millis(1000),
            max_payload_size: MAX_PAYLOAD_SIZE,
            channel_capacity: 64,
        }
    }
}
