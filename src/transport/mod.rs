//! # Transport Layer
//!
//! Three interchangeable wire transports behind one [`Listener`]/[`Connection`]
//! contract, plus an in-process pipe for embedding and tests.
//!
//! ## Transports
//! - **TCP** (`tcp`): stream sockets, optionally wrapped in TLS
//! - **KCP** (`kcp`): reliable UDP tuned by [`KcpMode`], optionally wrapped in TLS
//! - **WebSocket** (`websocket`): HTTP upgrade on a fixed path, one binary
//!   message per frame
//! - **Local**: `tokio::io::duplex` pipes, same codec as the stream transports
//!
//! Every read and write is bounded by the configured per-operation deadline.
//! Listener construction failures (bad address, TLS material, unknown
//! transport name) are returned to the caller and never retried here.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::packet::{Packet, PacketPool};
use crate::error::{ProtocolError, Result};
use crate::utils::timeout::{DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT};

pub mod handoff;
pub mod kcp;
pub mod local;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod websocket;

/// A live, exclusively owned transport channel carrying whole packets.
///
/// `close` is idempotent; after it returns, pending and future reads fail
/// with [`ProtocolError::ConnectionClosed`].
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Read one packet, bounded by the read deadline.
    async fn read_packet(&self) -> Result<Packet>;

    /// Write one packet, bounded by the write deadline. The packet is freed.
    async fn write_packet(&self, packet: Packet) -> Result<()>;

    /// Address of the peer as seen by this side
    fn real_ip(&self) -> &str;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Accepts inbound [`Connection`]s.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next connection. Fails with
    /// [`ProtocolError::ListenerClosed`] once the listener is closed.
    async fn accept(&self) -> Result<Arc<dyn Connection>>;

    async fn close(&self);

    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Wire transport selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    #[default]
    Tcp,
    Kcp,
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Kcp => "kcp",
            TransportKind::WebSocket => "websocket",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "kcp" => Ok(TransportKind::Kcp),
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            _ => Err(ProtocolError::UnsupportedTransport(s.to_string())),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TransportKind> for String {
    fn from(kind: TransportKind) -> Self {
        kind.as_str().to_string()
    }
}

/// KCP tuning profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KcpMode {
    /// Conservative retransmission, 40ms update interval
    Normal,
    /// No-delay, 10ms interval, fast resend, no congestion window
    #[default]
    Fast,
}

impl FromStr for KcpMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(KcpMode::Normal),
            "fast" => Ok(KcpMode::Fast),
            _ => Err(ProtocolError::ConfigError(format!("Unknown KCP mode: {s}"))),
        }
    }
}

/// Per-operation deadlines. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnTimeouts {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl ConnTimeouts {
    pub fn new(read: Duration, write: Duration) -> Self {
        Self {
            read: Some(read).filter(|d| !d.is_zero()),
            write: Some(write).filter(|d| !d.is_zero()),
        }
    }

    pub fn none() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

impl Default for ConnTimeouts {
    fn default() -> Self {
        Self::new(DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT)
    }
}

/// Server-side transport settings
#[derive(Clone)]
pub struct ListenOptions {
    pub address: String,
    pub timeouts: ConnTimeouts,
    pub kcp_mode: KcpMode,
    pub websocket_path: String,
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl ListenOptions {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            timeouts: ConnTimeouts::default(),
            kcp_mode: KcpMode::default(),
            websocket_path: String::from("/ws"),
            tls: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ConnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_kcp_mode(mut self, mode: KcpMode) -> Self {
        self.kcp_mode = mode;
        self
    }

    pub fn with_websocket_path<S: Into<String>>(mut self, path: S) -> Self {
        self.websocket_path = path.into();
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Client-side transport settings
#[derive(Clone)]
pub struct DialOptions {
    pub address: String,
    pub timeouts: ConnTimeouts,
    pub kcp_mode: KcpMode,
    pub websocket_path: String,
    pub tls: Option<(Arc<rustls::ClientConfig>, rustls::ServerName)>,
}

impl DialOptions {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            timeouts: ConnTimeouts::default(),
            kcp_mode: KcpMode::default(),
            websocket_path: String::from("/ws"),
            tls: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ConnTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_kcp_mode(mut self, mode: KcpMode) -> Self {
        self.kcp_mode = mode;
        self
    }

    pub fn with_websocket_path<S: Into<String>>(mut self, path: S) -> Self {
        self.websocket_path = path.into();
        self
    }

    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>, server_name: rustls::ServerName) -> Self {
        self.tls = Some((config, server_name));
        self
    }
}

/// Bind a listener for `kind`.
pub async fn listen(
    kind: TransportKind,
    options: ListenOptions,
    pool: PacketPool,
) -> Result<Box<dyn Listener>> {
    let listener: Box<dyn Listener> = match kind {
        TransportKind::Tcp => Box::new(tcp::TcpTransport::bind(options, pool).await?),
        TransportKind::Kcp => Box::new(kcp::KcpTransport::bind(options, pool).await?),
        TransportKind::WebSocket => {
            Box::new(websocket::WebSocketTransport::bind(options, pool).await?)
        }
    };
    Ok(listener)
}

/// Dial a server over `kind`.
pub async fn connect(
    kind: TransportKind,
    options: DialOptions,
    pool: PacketPool,
) -> Result<Arc<dyn Connection>> {
    match kind {
        TransportKind::Tcp => tcp::connect(options, pool).await,
        TransportKind::Kcp => kcp::connect(options, pool).await,
        TransportKind::WebSocket => websocket::connect(options, pool).await,
    }
}
