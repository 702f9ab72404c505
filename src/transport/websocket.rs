//! WebSocket transport.
//!
//! The listener serves HTTP upgrades on one path; any other path gets a
//! `404 Not Found`. Each binary message carries exactly one packet, header
//! included, so tungstenite refuses messages larger than [`MAX_MESSAGE_LEN`]
//! before buffering them. Upgrades run on their own tasks and hand finished
//! connections to [`Listener::accept`] through a queue, so a slow handshake
//! never stalls the accept loop.
//!
//! The peer address reported for a connection prefers the first
//! `X-Forwarded-For` entry, then `X-Real-IP`, then the socket address.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::core::packet::{Packet, PacketPool, HEADER_LEN, MAX_BODY_LEN};
use crate::error::{ProtocolError, Result};
use crate::transport::handoff::{Handoff, Incoming, ACCEPT_RETRY};
use crate::transport::{tls, ConnTimeouts, Connection, DialOptions, ListenOptions, Listener};
use crate::utils::timeout::{close_deadline, with_deadline};

/// Largest message a packet can occupy
pub const MAX_MESSAGE_LEN: usize = HEADER_LEN + MAX_BODY_LEN;

/// Limits oversized messages before they are buffered.
pub fn frame_limits() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_LEN);
    config.max_frame_size = Some(MAX_MESSAGE_LEN);
    config
}

fn ws_error(e: WsError) -> ProtocolError {
    match e {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ProtocolError::ConnectionClosed,
        WsError::Io(e) => ProtocolError::Io(e),
        other => ProtocolError::WebSocketError(other.to_string()),
    }
}

/// Client address from proxy headers, if any
fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    forwarded_for.or_else(real_ip).map(str::to_string)
}

/// [`Connection`] over an upgraded WebSocket stream.
pub struct WsConnection<S> {
    reader: Mutex<SplitStream<WebSocketStream<S>>>,
    writer: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    real_ip: String,
    timeouts: ConnTimeouts,
    pool: PacketPool,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl<S> WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: WebSocketStream<S>,
        real_ip: String,
        timeouts: ConnTimeouts,
        pool: PacketPool,
    ) -> Self {
        let (writer, reader) = stream.split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            real_ip,
            timeouts,
            pool,
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> Connection for WsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_packet(&self) -> Result<Packet> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;
        let next = async {
            loop {
                match reader.next().await {
                    None => return Err(ProtocolError::ConnectionClosed),
                    Some(Err(e)) => return Err(ws_error(e)),
                    Some(Ok(WsMessage::Binary(data))) => return self.pool.parse(&data),
                    Some(Ok(WsMessage::Close(_))) => return Err(ProtocolError::ConnectionClosed),
                    Some(Ok(WsMessage::Text(_))) => {
                        return Err(ProtocolError::WebSocketError(
                            "text frames are not supported".into(),
                        ))
                    }
                    // Ping/Pong are answered by tungstenite
                    Some(Ok(_)) => continue,
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = with_deadline(self.timeouts.read, next) => result,
        }
    }

    async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let data = packet.as_bytes().to_vec();
        packet.free()?;

        let mut writer = self.writer.lock().await;
        let send = async { writer.send(WsMessage::Binary(data)).await.map_err(ws_error) };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = with_deadline(self.timeouts.write, send) => result,
        }
    }

    fn real_ip(&self) -> &str {
        &self.real_ip
    }

    async fn close(&self) {
        if self.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        let close = async { SinkExt::close(&mut *writer).await.map_err(ws_error) };
        if let Err(e) = with_deadline(close_deadline(self.timeouts), close).await {
            debug!(peer = %self.real_ip, error = %e, "Error while closing WebSocket");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

struct UpgradeSettings {
    path: String,
    timeouts: ConnTimeouts,
    pool: PacketPool,
    acceptor: Option<TlsAcceptor>,
}

pub struct WebSocketTransport {
    handoff: Handoff,
    local_addr: SocketAddr,
}

impl WebSocketTransport {
    #[instrument(skip(options, pool), fields(address = %options.address, path = %options.websocket_path))]
    pub async fn bind(options: ListenOptions, pool: PacketPool) -> Result<Self> {
        let listener = TcpListener::bind(&options.address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, tls = options.tls.is_some(), "WebSocket listener bound");

        let settings = Arc::new(UpgradeSettings {
            path: options.websocket_path,
            timeouts: options.timeouts,
            pool,
            acceptor: options.tls.map(TlsAcceptor::from),
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
impl Listener for WebSocketTransport {
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

async fn serve(listener: TcpListener, settings: Arc<UpgradeSettings>, incoming: Incoming) {
    loop {
        let accepted = tokio::select! {
            _ = incoming.closed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                incoming.spawn_handshake(peer.to_string(), upgrade(stream, peer, settings.clone()));
            }
            Err(e) => {
                error!(error = %e, "Error accepting WebSocket connection");
                tokio::time::sleep(ACCEPT_RETRY).await;
            }
        }
    }
    debug!("WebSocket accept loop stopped");
}

async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<UpgradeSettings>,
) -> Result<Arc<dyn Connection>> {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }

    match &settings.acceptor {
        Some(acceptor) => {
            let tls_stream = tls::accept(acceptor, stream).await?;
            handshake(tls_stream, peer, &settings).await
        }
        None => handshake(stream, peer, &settings).await,
    }
}

async fn handshake<S>(
    stream: S,
    peer: SocketAddr,
    settings: &UpgradeSettings,
) -> Result<Arc<dyn Connection>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut forwarded = None;
    let expected_path = settings.path.as_str();

    let callback = |request: &Request, response: Response| {
        if request.uri().path() != expected_path {
            let mut not_found = ErrorResponse::new(Some("Not Found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        forwarded = forwarded_ip(request.headers());
        Ok(response)
    };

    let ws_stream = with_deadline(Some(tls::HANDSHAKE_TIMEOUT), async {
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(frame_limits()))
            .await
            .map_err(ws_error)
    })
    .await?;

    let real_ip = forwarded.unwrap_or_else(|| peer.to_string());
    Ok(Arc::new(WsConnection::new(
        ws_stream,
        real_ip,
        settings.timeouts,
        settings.pool.clone(),
    )))
}

#[instrument(skip(options, pool), fields(address = %options.address, path = %options.websocket_path))]
pub async fn connect(options: DialOptions, pool: PacketPool) -> Result<Arc<dyn Connection>> {
    let stream = with_deadline(options.timeouts.write, async {
        Ok(TcpStream::connect(&options.address).await?)
    })
    .await?;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?.to_string();

    match options.tls {
        Some((config, server_name)) => {
            let url = format!("wss://{}{}", options.address, options.websocket_path);
            let tls_stream = tls::connect(config, server_name, stream).await?;
            client_handshake(url, tls_stream, peer, options.timeouts, pool).await
        }
        None => {
            let url = format!("ws://{}{}", options.address, options.websocket_path);
            client_handshake(url, stream, peer, options.timeouts, pool).await
        }
    }
}

async fn client_handshake<S>(
    url: String,
    stream: S,
    peer: String,
    timeouts: ConnTimeouts,
    pool: PacketPool,
) -> Result<Arc<dyn Connection>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_stream, _response) = with_deadline(Some(tls::HANDSHAKE_TIMEOUT), async {
        tokio_tungstenite::client_async_with_config(url, stream, Some(frame_limits()))
            .await
            .map_err(ws_error)
    })
    .await?;

    Ok(Arc::new(WsConnection::new(ws_stream, peer, timeouts, pool)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[test]
    fn test_forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(forwarded_ip(&headers).as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_frame_limits_fit_one_packet() {
        let config = frame_limits();
        assert_eq!(config.max_message_size, Some(4 + 65535));
        assert_eq!(config.max_frame_size, Some(4 + 65535));
    }

    #[test]
    fn test_real_ip_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(forwarded_ip(&headers).as_deref(), Some("10.9.9.9"));
        assert_eq!(forwarded_ip(&HeaderMap::new()), None);
    }
}
