//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Behaves like a stream transport (same codec, same deadlines) without
//! touching the network. Useful for embedding a server next to a bot client
//! and for tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::core::packet::PacketPool;
use crate::error::{ProtocolError, Result};
use crate::transport::stream::StreamConnection;
use crate::transport::{ConnTimeouts, Connection, Listener};

/// Bytes buffered in each direction of a pipe
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Create a connected listener/connector pair.
pub fn pipe(pool: PacketPool, timeouts: ConnTimeouts) -> (LocalListener, LocalConnector) {
    let (tx, rx) = mpsc::channel(64);
    let closed = CancellationToken::new();

    let listener = LocalListener {
        incoming: Mutex::new(rx),
        closed: closed.clone(),
    };
    let connector = LocalConnector {
        tx,
        pool,
        timeouts,
        next_peer: Arc::new(AtomicU64::new(1)),
        listener_closed: closed,
    };
    (listener, connector)
}

pub struct LocalListener {
    incoming: Mutex<mpsc::Receiver<Arc<dyn Connection>>>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for LocalListener {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::ListenerClosed),
            conn = incoming.recv() => conn.ok_or(ProtocolError::ListenerClosed),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Dials a [`LocalListener`]. Cheap to clone.
#[derive(Clone)]
pub struct LocalConnector {
    tx: mpsc::Sender<Arc<dyn Connection>>,
    pool: PacketPool,
    timeouts: ConnTimeouts,
    next_peer: Arc<AtomicU64>,
    listener_closed: CancellationToken,
}

impl LocalConnector {
    /// Open a new pipe; the server half is queued for `accept`.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<Arc<dyn Connection>> {
        if self.listener_closed.is_cancelled() {
            return Err(ProtocolError::ListenerClosed);
        }

        let peer = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);

        let server: Arc<dyn Connection> = Arc::new(StreamConnection::new(
            server_io,
            format!("local:{peer}"),
            self.timeouts,
            self.pool.clone(),
        ));
        self.tx
            .send(server)
            .await
            .map_err(|_| ProtocolError::ListenerClosed)?;

        debug!(peer, "Local pipe opened");
        Ok(Arc::new(StreamConnection::new(
            client_io,
            String::from("local:server"),
            self.timeouts,
            self.pool.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_round_trip() {
        let pool = PacketPool::new(4);
        let (listener, connector) = pipe(pool.clone(), ConnTimeouts::none());

        let client = connector.connect().await.unwrap();
        let server = listener.accept().await.unwrap();
        assert_eq!(server.real_ip(), "local:1");

        client.write_packet(pool.build(2, b"hi").unwrap()).await.unwrap();
        let packet = server.read_packet().await.unwrap();
        assert_eq!((packet.opcode(), packet.body()), (2, &b"hi"[..]));
    }

    #[tokio::test]
    async fn test_closed_listener() {
        let (listener, connector) = pipe(PacketPool::default(), ConnTimeouts::none());
        listener.close().await;
        assert!(matches!(listener.accept().await, Err(ProtocolError::ListenerClosed)));
        assert!(matches!(connector.connect().await, Err(ProtocolError::ListenerClosed)));
    }
}
