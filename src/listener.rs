//! Accept side
//!
//! A [`Listener`] installs itself as its multiplexer's single listener and
//! turns inbound handshakes from unknown remotes into per-peer
//! [`Connection`]s. At most one handshake is in flight per listener;
//! further handshakes wait in the listener channel.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{Result, TransportError};
use crate::multiplexer::Multiplexer;
use crate::packet::Packet;
use crate::registry;

pub struct Listener {
    mux: Arc<Multiplexer>,
    incoming: Mutex<mpsc::Receiver<(Packet, SocketAddr)>>,
    config: TransportConfig,
}

impl Listener {
    /// Bind a listener to a local endpoint; port zero picks one. Fails if
    /// the endpoint's multiplexer already has a listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_config(addr, TransportConfig::default()).await
    }

    pub async fn bind_with_config(addr: SocketAddr, config: TransportConfig) -> Result<Self> {
        let mux = registry::bind(addr).await?;
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        if !mux.set_listener(tx) {
            return Err(TransportError::InvalidArgument);
        }
        Ok(Self {
            mux,
            incoming: Mutex::new(rx),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    /// Accept the next incoming connection: take a handshake from an
    /// unknown remote, spawn a per-peer connection registered under that
    /// remote, and resolve once its handshake completes.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            let (packet, remote) = {
                let mut incoming = self.incoming.lock().await;
                match incoming.recv().await {
                    Some(next) => next,
                    None => return Err(TransportError::Cancelled),
                }
            };

            let connection = Connection::attached(self.mux.clone(), remote, self.config.clone());
            let established = connection.begin_listen().await;

            if !self.mux.add(remote, connection.packet_sender()) {
                // The remote raced an existing connection; its handshake
                // retransmission will be routed there.
                debug!("dropping handshake from already-connected remote {}", remote);
                continue;
            }
            if connection.feed(packet).await.is_err() {
                continue;
            }

            return match established.await {
                Ok(Ok(())) => Ok(connection),
                Ok(Err(error)) => Err(error),
                Err(_) => Err(TransportError::Cancelled),
            };
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.mux.clear_listener();
    }
}
