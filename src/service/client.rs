//! Client side of the protocol, for bots, load tools and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::core::message::Message;
use crate::core::packet::{Packet, PacketPool, NO_OPCODE};
use crate::error::Result;
use crate::protocol::RawOpcode;
use crate::transport::{self, Connection, DialOptions, TransportKind};

/// Packets buffered between the receive loop and [`Client::receive`]
const RECEIVE_QUEUE: usize = 1024;

pub struct Client {
    conn: Arc<dyn Connection>,
    pool: PacketPool,
    inbox: Mutex<mpsc::Receiver<Packet>>,
    receiver: JoinHandle<()>,
    closed: AtomicBool,
}

impl Client {
    /// Dial a server over `kind`.
    #[instrument(skip(options, pool), fields(address = %options.address))]
    pub async fn connect(kind: TransportKind, options: DialOptions, pool: PacketPool) -> Result<Self> {
        let conn = transport::connect(kind, options, pool.clone()).await?;
        Ok(Self::from_connection(conn, pool))
    }

    /// Wrap an already-established connection.
    pub fn from_connection(conn: Arc<dyn Connection>, pool: PacketPool) -> Self {
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE);
        let receiver = tokio::spawn(receive_loop(conn.clone(), tx));
        Self {
            conn,
            pool,
            inbox: Mutex::new(rx),
            receiver,
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Encode `message` and send it under `opcode`.
    pub async fn send<M: Message>(&self, opcode: impl Into<RawOpcode>, message: &M) -> Result<()> {
        let opcode = opcode.into().narrow()?;
        let packet = self.pool.build(opcode, &message.encode()?)?;
        self.conn.write_packet(packet).await
    }

    pub async fn send_packet(&self, packet: Packet) -> Result<()> {
        self.conn.write_packet(packet).await
    }

    /// Next packet from the server, or `None` once the connection is gone.
    pub async fn receive(&self) -> Option<Packet> {
        self.inbox.lock().await.recv().await
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conn.close().await;
        self.receiver.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.conn.is_closed()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

async fn receive_loop(conn: Arc<dyn Connection>, tx: mpsc::Sender<Packet>) {
    loop {
        match conn.read_packet().await {
            Ok(packet) if packet.opcode() == NO_OPCODE => {
                debug!("Dropping packet with reserved opcode");
            }
            Ok(packet) => {
                if tx.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_disconnect() => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Client read failed");
                break;
            }
        }
    }
}
