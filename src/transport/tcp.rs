//! TCP transport, optionally wrapped in TLS.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument};

use crate::core::packet::PacketPool;
use crate::error::Result;
use crate::transport::handoff::{Handoff, Incoming, ACCEPT_RETRY};
use crate::transport::stream::StreamConnection;
use crate::transport::{tls, ConnTimeouts, Connection, DialOptions, ListenOptions, Listener};
use crate::utils::timeout::with_deadline;

struct AcceptSettings {
    acceptor: Option<TlsAcceptor>,
    timeouts: ConnTimeouts,
    pool: PacketPool,
}

/// TCP listener. Sockets are accepted on a background task; TLS handshakes
/// each run on their own task.
pub struct TcpTransport {
    handoff: Handoff,
    local_addr: SocketAddr,
}

impl TcpTransport {
    #[instrument(skip(options, pool), fields(address = %options.address))]
    pub async fn bind(options: ListenOptions, pool: PacketPool) -> Result<Self> {
        let listener = TcpListener::bind(&options.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, tls = options.tls.is_some(), "TCP listener bound");

        let settings = Arc::new(AcceptSettings {
            acceptor: options.tls.map(TlsAcceptor::from),
            timeouts: options.timeouts,
            pool,
        });
        let (handoff, incoming) = Handoff::new();
        tokio::spawn(serve(listener, settings, incoming));

        Ok(Self {
            handoff,
            local_addr,
        })
    }
}

#[async_trait]
impl Listener for TcpTransport {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        self.handoff.accept().await
    }

    async fn close(&self) {
        self.handoff.close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

async fn serve(listener: TcpListener, settings: Arc<AcceptSettings>, incoming: Incoming) {
    loop {
        let accepted = tokio::select! {
            _ = incoming.closed() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Error accepting TCP connection");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        match &settings.acceptor {
            Some(acceptor) => {
                let handshake = accept_tls(acceptor.clone(), stream, peer, settings.clone());
                incoming.spawn_handshake(peer.to_string(), handshake);
            }
            None => {
                let conn = Arc::new(StreamConnection::new(
                    stream,
                    peer.to_string(),
                    settings.timeouts,
                    settings.pool.clone(),
                ));
                incoming.deliver(conn).await;
            }
        }
    }
    debug!("TCP accept loop stopped");
}

async fn accept_tls(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<AcceptSettings>,
) -> Result<Arc<dyn Connection>> {
    let tls_stream = tls::accept(&acceptor, stream).await?;
    Ok(Arc::new(StreamConnection::new(
        tls_stream,
        peer.to_string(),
        settings.timeouts,
        settings.pool.clone(),
    )))
}

#[instrument(skip(options, pool), fields(address = %options.address))]
pub async fn connect(options: DialOptions, pool: PacketPool) -> Result<Arc<dyn Connection>> {
    let stream = with_deadline(options.timeouts.write, async {
        Ok(TcpStream::connect(&options.address).await?)
    })
    .await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?.to_string();

    let conn: Arc<dyn Connection> = match options.tls {
        Some((config, server_name)) => {
            let tls_stream = tls::connect(config, server_name, stream).await?;
            Arc::new(StreamConnection::new(tls_stream, peer, options.timeouts, pool))
        }
        None => Arc::new(StreamConnection::new(stream, peer, options.timeouts, pool)),
    };
    Ok(conn)
}
