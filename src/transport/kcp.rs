//! KCP transport: reliable ordered delivery over UDP, run in stream mode so
//! the regular packet codec frames it.
//!
//! | mode   | nodelay | interval | resend | no congestion control |
//! |--------|---------|----------|--------|-----------------------|
//! | normal | off     | 40ms     | 0      | off                   |
//! | fast   | on      | 10ms     | 2      | on                    |
//!
//! Both modes use a 4096/4096 send/receive window.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_kcp::{KcpConfig, KcpListener, KcpNoDelayConfig, KcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument};

use crate::core::packet::PacketPool;
use crate::error::{ProtocolError, Result};
use crate::transport::handoff::{Handoff, Incoming, ACCEPT_RETRY};
use crate::transport::stream::StreamConnection;
use crate::transport::{
    tls, ConnTimeouts, Connection, DialOptions, KcpMode, ListenOptions, Listener,
};
use crate::utils::timeout::with_deadline;

/// Send and receive window, in segments
pub const KCP_WINDOW: u16 = 4096;

impl KcpMode {
    pub fn nodelay_config(&self) -> KcpNoDelayConfig {
        match self {
            KcpMode::Normal => KcpNoDelayConfig {
                nodelay: false,
                interval: 40,
                resend: 0,
                nc: false,
            },
            KcpMode::Fast => KcpNoDelayConfig {
                nodelay: true,
                interval: 10,
                resend: 2,
                nc: true,
            },
        }
    }

    pub fn kcp_config(&self) -> KcpConfig {
        KcpConfig {
            nodelay: self.nodelay_config(),
            wnd_size: (KCP_WINDOW, KCP_WINDOW),
            stream: true,
            ..Default::default()
        }
    }
}

fn kcp_error(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::TransportError(format!("KCP: {e}"))
}

struct AcceptSettings {
    acceptor: Option<TlsAcceptor>,
    timeouts: ConnTimeouts,
    pool: PacketPool,
}

pub struct KcpTransport {
    handoff: Handoff,
    local_addr: Option<SocketAddr>,
}

impl KcpTransport {
    #[instrument(skip(options, pool), fields(address = %options.address, mode = ?options.kcp_mode))]
    pub async fn bind(options: ListenOptions, pool: PacketPool) -> Result<Self> {
        let listener = KcpListener::bind(options.kcp_mode.kcp_config(), &options.address)
            .await
            .map_err(kcp_error)?;
        let local_addr = listener.local_addr().ok();
        info!(address = ?local_addr, tls = options.tls.is_some(), "KCP listener bound");

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
impl Listener for KcpTransport {
    async fn accept(&self) -> Result<Arc<dyn Connection>> {
        self.handoff.accept().await
    }

    async fn close(&self) {
        self.handoff.close();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

async fn serve(mut listener: KcpListener, settings: Arc<AcceptSettings>, incoming: Incoming) {
    loop {
        let accepted = tokio::select! {
            _ = incoming.closed() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Error accepting KCP session");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };

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
    debug!("KCP accept loop stopped");
}

async fn accept_tls(
    acceptor: TlsAcceptor,
    stream: KcpStream,
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

#[instrument(skip(options, pool), fields(address = %options.address, mode = ?options.kcp_mode))]
pub async fn connect(options: DialOptions, pool: PacketPool) -> Result<Arc<dyn Connection>> {
    let addr = tokio::net::lookup_host(&options.address)
        .await?
        .next()
        .ok_or_else(|| kcp_error(format!("cannot resolve {}", options.address)))?;

    let config = options.kcp_mode.kcp_config();
    let stream = with_deadline(options.timeouts.write, async {
        KcpStream::connect(&config, addr).await.map_err(kcp_error)
    })
    .await?;
    let peer = addr.to_string();

    let conn: Arc<dyn Connection> = match options.tls {
        Some((config, server_name)) => {
            let tls_stream = tls::connect(config, server_name, stream).await?;
            Arc::new(StreamConnection::new(tls_stream, peer, options.timeouts, pool))
        }
        None => Arc::new(StreamConnection::new(stream, peer, options.timeouts, pool)),
    };
    Ok(conn)
}
