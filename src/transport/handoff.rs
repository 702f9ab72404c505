//! Queue between a transport's socket accept loop and [`Listener::accept`].
//!
//! Network transports accept sockets on a background task and run any
//! per-connection handshake (TLS, WebSocket upgrade) on a task of its own.
//! Finished connections are queued here, so one peer that never completes
//! its handshake cannot hold up anyone else.
//!
//! [`Listener::accept`]: crate::transport::Listener::accept

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::transport::Connection;

/// Connections waiting for `accept`
pub const HANDOFF_QUEUE: usize = 128;

/// Pause after a socket accept error before trying again
pub const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Receiving end, owned by the listener.
pub struct Handoff {
    incoming: Mutex<mpsc::Receiver<Arc<dyn Connection>>>,
    closed: CancellationToken,
}

/// Sending end, cloned into the accept loop and every handshake task.
#[derive(Clone)]
pub struct Incoming {
    tx: mpsc::Sender<Arc<dyn Connection>>,
    closed: CancellationToken,
}

impl Handoff {
    pub fn new() -> (Self, Incoming) {
        let (tx, rx) = mpsc::channel(HANDOFF_QUEUE);
        let closed = CancellationToken::new();
        let incoming = Incoming {
            tx,
            closed: closed.clone(),
        };
        (
            Self {
                incoming: Mutex::new(rx),
                closed,
            },
            incoming,
        )
    }

    pub async fn accept(&self) -> Result<Arc<dyn Connection>> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::ListenerClosed),
            conn = incoming.recv() => conn.ok_or(ProtocolError::ListenerClosed),
        }
    }

    /// Stop the accept loop and refuse queued connections.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Incoming {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the listener is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Queue `conn` for `accept`. Closes it if the listener goes away first.
    pub async fn deliver(&self, conn: Arc<dyn Connection>) {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => conn.close().await,
            sent = self.tx.send(conn.clone()) => {
                if sent.is_err() {
                    conn.close().await;
                }
            }
        }
    }

    /// Run `handshake` on its own task and queue the connection it yields.
    pub fn spawn_handshake<F>(&self, peer: String, handshake: F)
    where
        F: Future<Output = Result<Arc<dyn Connection>>> + Send + 'static,
    {
        let incoming = self.clone();
        tokio::spawn(async move {
            let conn = tokio::select! {
                _ = incoming.closed() => return,
                conn = handshake => conn,
            };
            match conn {
                Ok(conn) => incoming.deliver(conn).await,
                Err(e) => debug!(%peer, error = %e, "Handshake failed"),
            }
        });
    }
}
