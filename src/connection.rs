//! Connection engine
//!
//! A [`Connection`] is one logical reliable, ordered, message-preserving
//! channel to a single peer. The handle exposes the async operations;
//! a per-connection driver task owns protocol processing: it selects over
//! the multiplexer's routing channel, wakeups from the handle, and the
//! transmit queue's retransmission deadline. All state lives behind one
//! async mutex touched only by the driver and the short non-blocking
//! sections of the public operations.
//!
//! Handshake is three-way: the initiator's HANDSHAKE carries its initial
//! sequence; the responder answers with its own HANDSHAKE acknowledging
//! that initial; the initiator completes with a KEEPALIVE acknowledging
//! the responder's initial. Data flows once both sides are established;
//! each accepted in-order datagram is confirmed with a KEEPALIVE unless a
//! queued outbound frame already carries the cumulative ack.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::multiplexer::{Multiplexer, PacketReceiver, PacketSender};
use crate::packet::{Packet, PacketKind};
use crate::receive_queue::{copy_into, ReceiveQueue};
use crate::registry;
use crate::sequence::SequenceNumber;
use crate::transmit_queue::{OutboundFrame, TransmitCompletion, TransmitQueue};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No network state; the initial and terminal state.
    Closed,
    /// Waiting for a peer's handshake (accept side).
    Listening,
    /// Initial handshake sent, awaiting the peer's answer (connect side).
    Connecting,
    /// Three-way exchange in progress; the peer's initial is recorded.
    Handshaking,
    /// Bidirectional data flow permitted.
    Established,
}

impl ConnectionState {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// A connect or accept is in flight.
    pub fn is_handshaking(&self) -> bool {
        matches!(self, Self::Listening | Self::Connecting | Self::Handshaking)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Listening => write!(f, "LISTENING"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Handshaking => write!(f, "HANDSHAKING"),
            Self::Established => write!(f, "ESTABLISHED"),
        }
    }
}

/// Per-connection counters.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Payload bytes put on the wire, excluding retransmissions.
    pub bytes_sent: u64,
    /// Payload bytes accepted in order.
    pub bytes_received: u64,
    pub retransmits: u64,
    pub dropped_out_of_order: u64,
}

struct ConnectionInner {
    config: TransportConfig,
    mux: Option<Arc<Multiplexer>>,
    remote: Option<SocketAddr>,
    state: ConnectionState,
    next_sequence: SequenceNumber,
    last_remote_sequence: Option<SequenceNumber>,
    transmit: TransmitQueue,
    receive: ReceiveQueue,
    /// Signalled exactly once when the handshake resolves.
    connect_tx: Option<oneshot::Sender<Result<()>>>,
    stats: ConnectionStats,
}

impl ConnectionInner {
    fn alloc_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        sequence
    }

    /// Strict in-order check: only the successor of the last accepted
    /// sequence is let in; with nothing accepted yet, anything is. Older
    /// duplicates and jumps ahead are both dropped.
    fn is_in_order(&self, sequence: SequenceNumber) -> bool {
        match self.last_remote_sequence {
            None => true,
            Some(last) => last.next() == sequence,
        }
    }

    fn enter_established(&mut self) {
        self.state = ConnectionState::Established;
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Tear everything down: deregister, cancel every pending completion,
    /// and return to `Closed`. `connect_error` resolves a pending connect.
    fn teardown(&mut self, connect_error: TransportError) {
        if let (Some(mux), Some(remote)) = (self.mux.as_ref(), self.remote.as_ref()) {
            mux.remove(remote);
        }
        self.state = ConnectionState::Closed;
        self.remote = None;
        self.transmit.cancel_all();
        self.receive.cancel_all();
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Err(connect_error));
        }
    }

    async fn process_packet(&mut self, packet: Packet) {
        self.stats.packets_received += 1;
        let ack = packet.ack;

        match packet.kind {
            PacketKind::Handshake => self.process_handshake(packet.sequence).await,
            PacketKind::Keepalive => self.process_keepalive(packet.sequence),
            PacketKind::Data => self.process_data(packet.sequence, packet.payload).await,
            PacketKind::Ack => {}
        }

        // A piggy-backed ack is processed after the kind-specific handler,
        // so a handshake that moves the state forward sees its own ack.
        if let Some(ack) = ack {
            self.process_acknowledgement(ack);
        }
    }

    async fn process_handshake(&mut self, peer_initial: SequenceNumber) {
        match self.state {
            ConnectionState::Listening => {
                self.last_remote_sequence = Some(peer_initial);
                self.state = ConnectionState::Handshaking;
                let sequence = self.alloc_sequence();
                self.transmit.push(
                    sequence,
                    0,
                    OutboundFrame::Handshake {
                        ack: Some(peer_initial),
                    },
                    TransmitCompletion::Handshake,
                );
            }

            ConnectionState::Connecting => {
                self.state = ConnectionState::Handshaking;
                self.last_remote_sequence = Some(peer_initial);
                let sequence = self.alloc_sequence();
                let (mux, remote) = match (self.mux.clone(), self.remote) {
                    (Some(mux), Some(remote)) => (mux, remote),
                    _ => return,
                };
                match mux.send_keepalive(remote, sequence, Some(peer_initial)).await {
                    Ok(()) => {
                        self.stats.packets_sent += 1;
                        self.enter_established();
                    }
                    Err(e) => {
                        warn!("handshake keepalive to {} failed: {}", remote, e);
                        self.teardown(TransportError::Substrate(e));
                    }
                }
            }

            ConnectionState::Handshaking | ConnectionState::Established => {
                // A retransmission; the peer keeps retrying until our
                // cumulative ack reaches it on a queued frame.
                trace!("ignoring duplicate handshake in state {}", self.state);
            }

            ConnectionState::Closed => {
                trace!("dropping handshake in state {}", self.state);
            }
        }
    }

    fn process_acknowledgement(&mut self, ack: SequenceNumber) {
        match self.state {
            ConnectionState::Established => {
                self.transmit.apply_ack(ack);
            }
            ConnectionState::Handshaking => {
                self.enter_established();
                self.transmit.apply_ack(ack);
            }
            _ => {
                trace!("ignoring acknowledgement in state {}", self.state);
            }
        }
    }

    /// Keepalives consume sequence space, so an in-order one advances the
    /// window exactly like data; it just delivers nothing and is not
    /// confirmed (that would ping-pong forever).
    fn process_keepalive(&mut self, sequence: SequenceNumber) {
        if self.is_in_order(sequence) {
            self.last_remote_sequence = Some(sequence);
        } else {
            self.stats.dropped_out_of_order += 1;
            trace!("dropping out-of-order keepalive {}", sequence);
        }
    }

    async fn process_data(&mut self, sequence: SequenceNumber, payload: Vec<u8>) {
        if !self.is_in_order(sequence) {
            self.stats.dropped_out_of_order += 1;
            debug!(
                "dropping out-of-order data {} (last accepted {:?})",
                sequence,
                self.last_remote_sequence.map(|s| s.value())
            );
            return;
        }

        self.last_remote_sequence = Some(sequence);
        self.stats.bytes_received += payload.len() as u64;
        self.receive.push_payload(payload);

        // Delivery confirmation. Skipped while outbound frames are queued:
        // they carry the cumulative ack on their next transmission, and an
        // extra keepalive would burn a sequence the mid-transfer peer must
        // drop.
        if self.transmit.is_empty() {
            let sequence = self.alloc_sequence();
            if let (Some(mux), Some(remote)) = (self.mux.clone(), self.remote) {
                match mux
                    .send_keepalive(remote, sequence, self.last_remote_sequence)
                    .await
                {
                    Ok(()) => self.stats.packets_sent += 1,
                    Err(e) => debug!("delivery confirmation to {} failed: {}", remote, e),
                }
            }
        }
    }

    /// Put the head frame on the wire if it is due, arming its deadline.
    /// A hard substrate error removes the head, resolves its completion
    /// with the error, and moves on to the next entry.
    async fn flush_transmit(&mut self) {
        loop {
            let now = Instant::now();
            let head = match self.transmit.head_due(now) {
                Some(head) => head,
                None => return,
            };
            let (mux, remote) = match (self.mux.clone(), self.remote) {
                (Some(mux), Some(remote)) => (mux, remote),
                _ => return,
            };

            let result = match &head.frame {
                OutboundFrame::Handshake { ack } => mux
                    .send_handshake(remote, head.sequence, *ack)
                    .await
                    .map(|()| 0),
                OutboundFrame::Data { payload } => {
                    mux.send_data(remote, head.sequence, self.last_remote_sequence, payload)
                        .await
                }
            };

            match result {
                Ok(bytes) => {
                    self.stats.packets_sent += 1;
                    if head.retransmission {
                        self.stats.retransmits += 1;
                        trace!("retransmitting {} to {}", head.sequence, remote);
                    } else {
                        self.stats.bytes_sent += bytes as u64;
                    }
                    self.transmit.mark_head_transmitted(now);
                    return;
                }
                Err(e) => {
                    warn!("substrate send of {} to {} failed: {}", head.sequence, remote, e);
                    match self.transmit.take_failed_head() {
                        Some(TransmitCompletion::Send(tx)) => {
                            let _ = tx.send(Err(TransportError::Substrate(e)));
                        }
                        Some(TransmitCompletion::Handshake) => {
                            self.teardown(TransportError::Substrate(e));
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }
}

/// A handle to one reliable connection over UDP.
///
/// Multiple connections bound to the same local endpoint share one UDP
/// socket through the endpoint's multiplexer. Dropping the handle tears
/// the connection down.
pub struct Connection {
    inner: Arc<Mutex<ConnectionInner>>,
    notify: Arc<Notify>,
    packet_tx: PacketSender,
    driver: JoinHandle<()>,
}

impl Connection {
    /// Bind a connection to a local endpoint; port zero picks one.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, TransportConfig::default()).await
    }

    pub async fn bind_with_config(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let mux = registry::bind(addr).await?;
        Ok(Self::build(Some(mux), None, config))
    }

    /// A connection with no local endpoint. Connect on it fails with
    /// [`TransportError::InvalidArgument`]; send and receive with
    /// [`TransportError::NotConnected`].
    pub fn unbound() -> Self {
        Self::build(None, None, TransportConfig::default())
    }

    /// Accept-side construction: already attached to a multiplexer and a
    /// known remote, still `Closed` until `begin_listen`.
    pub(crate) fn attached(
        mux: Arc<Multiplexer>,
        remote: SocketAddr,
        config: TransportConfig,
    ) -> Self {
        Self::build(Some(mux), Some(remote), config)
    }

    fn build(
        mux: Option<Arc<Multiplexer>>,
        remote: Option<SocketAddr>,
        config: TransportConfig,
    ) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(config.channel_capacity);
        let inner = Arc::new(Mutex::new(ConnectionInner {
            mux,
            remote,
            state: ConnectionState::Closed,
            next_sequence: SequenceNumber::random(),
            last_remote_sequence: None,
            transmit: TransmitQueue::new(config.retransmit_timeout),
            receive: ReceiveQueue::new(),
            connect_tx: None,
            stats: ConnectionStats::default(),
            config,
        }));
        let notify = Arc::new(Notify::new());
        let driver = tokio::spawn(drive(inner.clone(), packet_rx, notify.clone()));
        Self {
            inner,
            notify,
            packet_tx,
            driver,
        }
    }

    /// Move into `Listening` and return the handle the accept loop awaits.
    pub(crate) async fn begin_listen(&self) -> oneshot::Receiver<Result<()>> {
        let mut inner = self.inner.lock().await;
        inner.state = ConnectionState::Listening;
        let (tx, rx) = oneshot::channel();
        inner.connect_tx = Some(tx);
        rx
    }

    /// The capability the multiplexer routes this connection's inbound
    /// datagrams through.
    pub(crate) fn packet_sender(&self) -> PacketSender {
        self.packet_tx.clone()
    }

    /// Hand a datagram straight to the driver (accept path).
    pub(crate) async fn feed(&self, packet: Packet) -> Result<()> {
        self.packet_tx
            .send(packet)
            .await
            .map_err(|_| TransportError::Cancelled)
    }

    /// Connect to a remote endpoint. Resolves once the connection is
    /// established or a terminal error occurs; an unspecified remote
    /// address is rewritten to the loopback of the matching family.
    pub async fn connect(&self, remote: SocketAddr) -> Result<()> {
        let pending = {
            let mut inner = self.inner.lock().await;
            let mux = match inner.mux.clone() {
                Some(mux) => mux,
                None => return Err(TransportError::InvalidArgument),
            };
            match inner.state {
                ConnectionState::Closed => {}
                ConnectionState::Established => return Err(TransportError::AlreadyConnected),
                _ => return Err(TransportError::AlreadyStarted),
            }

            let remote = rewrite_unspecified(remote);
            if !mux.add(remote, self.packet_tx.clone()) {
                return Err(TransportError::AlreadyConnected);
            }

            inner.state = ConnectionState::Connecting;
            inner.remote = Some(remote);
            let (tx, rx) = oneshot::channel();
            inner.connect_tx = Some(tx);

            let sequence = inner.alloc_sequence();
            inner.transmit.push(
                sequence,
                0,
                OutboundFrame::Handshake { ack: None },
                TransmitCompletion::Handshake,
            );
            rx
        };
        self.notify.notify_one();

        match pending.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Cancelled),
        }
    }

    /// Resolve `host:service` and try each candidate endpoint in order,
    /// reporting the last failure when all are exhausted.
    pub async fn connect_to(&self, host: &str, service: &str) -> Result<()> {
        {
            let inner = self.inner.lock().await;
            if inner.mux.is_none() {
                return Err(TransportError::InvalidArgument);
            }
        }
        let port: u16 = service.parse().map_err(|_| TransportError::InvalidArgument)?;
        let candidates: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();

        let mut last_error = TransportError::Unreachable;
        for candidate in candidates {
            match self.connect(candidate).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    debug!("connect to {} failed: {}", candidate, error);
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Send one message. Resolves with the byte count once the peer's
    /// cumulative acknowledgement covers it.
    pub async fn send(&self, payload: &[u8]) -> Result<usize> {
        let pending = {
            let mut inner = self.inner.lock().await;
            if inner.mux.is_none() || inner.remote.is_none() {
                return Err(TransportError::NotConnected);
            }
            if payload.is_empty() || payload.len() > inner.config.max_payload_size {
                return Err(TransportError::InvalidArgument);
            }

            let sequence = inner.alloc_sequence();
            let (tx, rx) = oneshot::channel();
            inner.transmit.push(
                sequence,
                payload.len(),
                OutboundFrame::Data {
                    payload: payload.to_vec(),
                },
                TransmitCompletion::Send(tx),
            );
            rx
        };
        self.notify.notify_one();

        match pending.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Cancelled),
        }
    }

    /// Receive one message into `buf`. A message longer than `buf` is
    /// truncated; the returned count is the number of bytes copied.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let pending = {
            let mut inner = self.inner.lock().await;
            if inner.mux.is_none() || inner.remote.is_none() {
                return Err(TransportError::NotConnected);
            }
            if let Some(payload) = inner.receive.pop_payload() {
                return Ok(copy_into(&payload, buf));
            }
            inner.receive.push_request()
        };

        match pending.await {
            Ok(Ok(payload)) => Ok(copy_into(&payload, buf)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(TransportError::Cancelled),
        }
    }

    /// Close the connection: deregister from the multiplexer and cancel
    /// every pending send, receive, and connect with
    /// [`TransportError::Cancelled`]. Idempotent.
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.teardown(TransportError::Cancelled);
        }
        self.notify.notify_one();
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner.lock().await;
        inner
            .mux
            .as_ref()
            .map(|mux| mux.local_addr())
            .ok_or(TransportError::InvalidArgument)
    }

    pub async fn peer_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner.lock().await;
        inner.remote.ok_or(TransportError::NotConnected)
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.inner.lock().await.stats.clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
        // Best effort: clear the route so the multiplexer stops delivering.
        // If the driver held the lock mid-abort, routing notices the closed
        // channel and prunes the entry itself.
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.teardown(TransportError::Cancelled);
        }
    }
}

/// Per-connection driver: protocol processing, retransmission, and flush
/// of newly queued frames, all on one task.
async fn drive(inner: Arc<Mutex<ConnectionInner>>, mut packet_rx: PacketReceiver, notify: Arc<Notify>) {
    loop {
        let deadline = { inner.lock().await.transmit.next_deadline() };

        tokio::select! {
            packet = packet_rx.recv() => match packet {
                Some(packet) => {
                    let mut inner = inner.lock().await;
                    inner.process_packet(packet).await;
                }
                // Every sender is gone; nothing can reach this connection
                // any more.
                None => break,
            },
            _ = notify.notified() => {}
            _ = retransmit_timer(deadline) => {}
        }

        let mut inner = inner.lock().await;
        inner.flush_transmit().await;
    }
}

async fn retransmit_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// An unspecified (wildcard) address is illegal as a connect target and is
/// rewritten to the loopback of the matching family.
fn rewrite_unspecified(remote: SocketAddr) -> SocketAddr {
    if !remote.ip().is_unspecified() {
        return remote;
    }
    let loopback = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    };
    SocketAddr::new(loopback, remote.port())
}
