//! Datagram multiplexer
//!
//! One multiplexer owns the UDP socket for a local endpoint and is shared
//! by every connection bound there. Inbound datagrams are decoded and
//! routed by the sender's address; a handshake from an unknown sender goes
//! to the listener, if one is installed. Outbound datagrams go out through
//! typed send helpers, one `send_to` per datagram, so concurrent senders
//! cannot interleave within a datagram.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::packet::{Packet, PacketKind};
use crate::sequence::SequenceNumber;

/// Capability handle the multiplexer invokes to reach a connection's
/// protocol entry points.
pub(crate) type PacketSender = mpsc::Sender<Packet>;
pub(crate) type PacketReceiver = mpsc::Receiver<Packet>;

/// Channel to the listening connection; carries the sender's endpoint
/// alongside the handshake.
pub(crate) type ListenerSender = mpsc::Sender<(Packet, SocketAddr)>;

type ConnectionMap = Arc<RwLock<HashMap<SocketAddr, PacketSender>>>;
type ListenerSlot = Arc<RwLock<Option<ListenerSender>>>;

pub(crate) struct Multiplexer {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    connections: ConnectionMap,
    listener: ListenerSlot,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Bind the shared socket and start the receive loop. The loop runs
    /// for the multiplexer's lifetime, so re-arming after each datagram is
    /// implicit.
    pub(crate) async fn bind(addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        let connections: ConnectionMap = Arc::new(RwLock::new(HashMap::new()));
        let listener: ListenerSlot = Arc::new(RwLock::new(None));

        let mux = Arc::new(Self {
            socket: socket.clone(),
            local_addr,
            connections: connections.clone(),
            listener: listener.clone(),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::receive_loop(socket, connections, listener));
        *mux.recv_task.lock() = Some(task);

        Ok(mux)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn receive_loop(socket: Arc<UdpSocket>, connections: ConnectionMap, listener: ListenerSlot) {
        let mut buf = vec![0u8; 2048];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, remote)) => match Packet::decode(&buf[..len]) {
                    Ok(packet) => {
                        Self::route(packet, remote, &connections, &listener).await;
                    }
                    Err(e) => {
                        debug!("failed to decode datagram from {}: {}", remote, e);
                    }
                },
                Err(e) => {
                    // Transient errors (e.g. ICMP-derived) must not take
                    // down a socket shared by every connection on this
                    // endpoint.
                    warn!("substrate receive error: {}", e);
                }
            }
        }
    }

    /// Route an inbound datagram to its connection, or to the listener for
    /// a handshake from an unknown sender.
    async fn route(
        packet: Packet,
        remote: SocketAddr,
        connections: &ConnectionMap,
        listener: &ListenerSlot,
    ) {
        let sender = connections.read().get(&remote).cloned();
        if let Some(tx) = sender {
            if tx.send(packet).await.is_ok() {
                return;
            }
            // The connection went away without deregistering; from here on
            // the remote counts as unknown again.
            connections.write().remove(&remote);
            debug!("removed stale route for {}", remote);
            return;
        }

        if packet.kind == PacketKind::Handshake {
            let tx = listener.read().clone();
            if let Some(tx) = tx {
                if tx.send((packet, remote)).await.is_err() {
                    *listener.write() = None;
                }
                return;
            }
        }

        trace!("dropping {:?} datagram from unknown remote {}", packet.kind, remote);
    }

    /// Register a connection under its remote endpoint. At most one
    /// connection per peer; returns false if the slot is taken.
    pub(crate) fn add(&self, remote: SocketAddr, tx: PacketSender) -> bool {
        match self.connections.write().entry(remote) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(tx);
                true
            }
        }
    }

    pub(crate) fn remove(&self, remote: &SocketAddr) {
        self.connections.write().remove(remote);
    }

    /// Install the single listener. Returns false if one is already there.
    pub(crate) fn set_listener(&self, tx: ListenerSender) -> bool {
        let mut slot = self.listener.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(tx);
        true
    }

    pub(crate) fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    pub(crate) async fn send_handshake(
        &self,
        dest: SocketAddr,
        sequence: SequenceNumber,
        ack: Option<SequenceNumber>,
    ) -> io::Result<()> {
        self.send_packet(&Packet::handshake(sequence, ack), dest)
            .await
            .map(|_| ())
    }

    pub(crate) async fn send_keepalive(
        &self,
        dest: SocketAddr,
        sequence: SequenceNumber,
        ack: Option<SequenceNumber>,
    ) -> io::Result<()> {
        self.send_packet(&Packet::keepalive(sequence, ack), dest)
            .await
            .map(|_| ())
    }

    /// Returns the payload size on success, for the send completion.
    pub(crate) async fn send_data(
        &self,
        dest: SocketAddr,
        sequence: SequenceNumber,
        ack: Option<SequenceNumber>,
        payload: &[u8],
    ) -> io::Result<usize> {
        let size = payload.len();
        self.send_packet(&Packet::data(sequence, ack, payload.to_vec()), dest)
            .await?;
        Ok(size)
    }

    async fn send_packet(&self, packet: &Packet, dest: SocketAddr) -> io::Result<usize> {
        trace!(
            "sending {:?} seq={} ack={:?} to {}",
            packet.kind,
            packet.sequence,
            packet.ack.map(|a| a.value()),
            dest
        );
        self.socket.send_to(&packet.encode(), dest).await
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind() {
        let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(mux.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_remote() {
        let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let remote: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(mux.add(remote, tx1));
        assert!(!mux.add(remote, tx2));

        mux.remove(&remote);
        let (tx3, _rx3) = mpsc::channel(1);
        assert!(mux.add(remote, tx3));
    }

    #[tokio::test]
    async fn test_single_listener_slot() {
        let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        assert!(mux.set_listener(tx1));
        assert!(!mux.set_listener(tx2));

        mux.clear_listener();
        let (tx3, _rx3) = mpsc::channel(1);
        assert!(mux.set_listener(tx3));
    }

    #[tokio::test]
    async fn test_routes_to_registered_connection() {
        let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        assert!(mux.add(peer_addr, tx));

        let packet = Packet::keepalive(SequenceNumber::new(5), None);
        peer.send_to(&packet.encode(), mux.local_addr()).await.unwrap();

        let routed = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("datagram was not routed")
            .expect("channel closed");
        assert!(routed.is_keepalive());
        assert_eq!(routed.sequence, SequenceNumber::new(5));
    }

    #[tokio::test]
    async fn test_handshake_from_unknown_remote_reaches_listener() {
        let mux = Multiplexer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        assert!(mux.set_listener(tx));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let packet = Packet::handshake(SequenceNumber::new(77), None);
        peer.send_to(&packet.encode(), mux.local_addr()).await.unwrap();

        let (routed, remote) = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("handshake was not routed")
            .expect("channel closed");
        assert!(routed.is_handshake());
        assert_eq!(remote, peer_addr);
    }
}
