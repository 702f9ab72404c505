//! Network transports driven through a running app.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gamenet::config::ServerConfig;
use gamenet::core::message::{Message, MessageType};
use gamenet::core::packet::PacketPool;
use gamenet::protocol::{handler, Context, RegisterParams};
use gamenet::service::{App, Client};
use gamenet::transport::tls::{load_certs, TlsClientConfig, TlsServerConfig};
use gamenet::transport::{self, DialOptions, ListenOptions, TransportKind};
use serde::{Deserialize, Serialize};
use tempfile::tempdir;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const OP_ECHO: u16 = 10;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Echo {
    text: String,
}

impl Message for Echo {
    const TYPE: MessageType = MessageType::new("test.Echo");
}

type Peers = Arc<Mutex<Vec<String>>>;

/// Serve an echo route that also records each caller's address.
async fn echo_server(kind: TransportKind, options: ListenOptions) -> (App, SocketAddr, Peers) {
    let listener = transport::listen(kind, options, PacketPool::default())
        .await
        .unwrap();
    let app = App::with_listener(listener, &ServerConfig::default());
    let peers = Arc::new(Mutex::new(Vec::new()));

    let seen = peers.clone();
    app.register::<Echo>(
        OP_ECHO,
        RegisterParams::new()
            .with_skip_validation()
            .with_handler(handler(move |ctx: Context| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.session().real_ip().to_string());
                    ctx.session().send_raw(OP_ECHO, ctx.body()).await
                }
            })),
    )
    .unwrap();

    let addr = app.local_addr().expect("network listener has an address");
    tokio::spawn({
        let app = app.clone();
        async move { app.run(Vec::new()).await }
    });
    (app, addr, peers)
}

async fn round_trip(client: &Client, text: &str) {
    client
        .send(OP_ECHO, &Echo { text: text.into() })
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), client.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.opcode(), OP_ECHO);
    assert_eq!(Echo::decode(reply.body()).unwrap().text, text);
}

#[tokio::test]
async fn tcp_echo() {
    let (app, addr, peers) =
        echo_server(TransportKind::Tcp, ListenOptions::new("127.0.0.1:0")).await;

    let client = Client::connect(
        TransportKind::Tcp,
        DialOptions::new(addr.to_string()),
        PacketPool::default(),
    )
    .await
    .unwrap();
    round_trip(&client, "over tcp").await;
    round_trip(&client, "twice").await;

    assert!(peers.lock().unwrap()[0].starts_with("127.0.0.1:"));
    client.close().await;
    app.destroy().await;
}

#[tokio::test]
async fn tcp_tls_with_pinned_certificate() {
    let dir = tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    let server_tls = TlsServerConfig::generate_self_signed(&cert_path, &key_path).unwrap();

    let options = ListenOptions::new("127.0.0.1:0")
        .with_tls(Arc::new(server_tls.load_server_config().unwrap()));
    let (app, addr, _) = echo_server(TransportKind::Tcp, options).await;

    let cert = load_certs(&cert_path).unwrap().remove(0);
    let client_tls = TlsClientConfig::new("localhost")
        .insecure()
        .with_pinned_cert_hash(TlsClientConfig::calculate_cert_hash(&cert));
    let dial = DialOptions::new(addr.to_string()).with_tls(
        Arc::new(client_tls.load_client_config().unwrap()),
        client_tls.server_name().unwrap(),
    );

    let client = Client::connect(TransportKind::Tcp, dial, PacketPool::default())
        .await
        .unwrap();
    round_trip(&client, "encrypted").await;
    client.close().await;
    app.destroy().await;
}

#[tokio::test]
async fn tcp_tls_rejects_wrong_pin() {
    let dir = tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    let server_tls = TlsServerConfig::generate_self_signed(&cert_path, &key_path).unwrap();

    let options = ListenOptions::new("127.0.0.1:0")
        .with_tls(Arc::new(server_tls.load_server_config().unwrap()));
    let (app, addr, _) = echo_server(TransportKind::Tcp, options).await;

    let client_tls = TlsClientConfig::new("localhost")
        .insecure()
        .with_pinned_cert_hash(vec![0u8; 32]);
    let dial = DialOptions::new(addr.to_string()).with_tls(
        Arc::new(client_tls.load_client_config().unwrap()),
        client_tls.server_name().unwrap(),
    );

    assert!(Client::connect(TransportKind::Tcp, dial, PacketPool::default())
        .await
        .is_err());

    // A failed handshake must not stop the accept loop
    let cert = load_certs(&cert_path).unwrap().remove(0);
    let client_tls = TlsClientConfig::new("localhost")
        .insecure()
        .with_pinned_cert_hash(TlsClientConfig::calculate_cert_hash(&cert));
    let dial = DialOptions::new(addr.to_string()).with_tls(
        Arc::new(client_tls.load_client_config().unwrap()),
        client_tls.server_name().unwrap(),
    );
    let client = Client::connect(TransportKind::Tcp, dial, PacketPool::default())
        .await
        .unwrap();
    round_trip(&client, "after a bad handshake").await;
    client.close().await;
    app.destroy().await;
}

#[tokio::test]
async fn silent_peer_does_not_delay_tls_handshakes() {
    let dir = tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    let server_tls = TlsServerConfig::generate_self_signed(&cert_path, &key_path).unwrap();

    let options = ListenOptions::new("127.0.0.1:0")
        .with_tls(Arc::new(server_tls.load_server_config().unwrap()));
    let (app, addr, _) = echo_server(TransportKind::Tcp, options).await;

    // Opens a socket and never sends a ClientHello
    let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cert = load_certs(&cert_path).unwrap().remove(0);
    let client_tls = TlsClientConfig::new("localhost")
        .insecure()
        .with_pinned_cert_hash(TlsClientConfig::calculate_cert_hash(&cert));
    let dial = DialOptions::new(addr.to_string()).with_tls(
        Arc::new(client_tls.load_client_config().unwrap()),
        client_tls.server_name().unwrap(),
    );

    let started = std::time::Instant::now();
    let client = tokio::time::timeout(
        Duration::from_secs(3),
        Client::connect(TransportKind::Tcp, dial, PacketPool::default()),
    )
    .await
    .expect("handshake must not wait behind the silent peer")
    .unwrap();
    round_trip(&client, "not stalled").await;
    assert!(started.elapsed() < Duration::from_secs(3));

    client.close().await;
    app.destroy().await;
}

#[tokio::test]
async fn websocket_echo() {
    let (app, addr, _) = echo_server(
        TransportKind::WebSocket,
        ListenOptions::new("127.0.0.1:0").with_websocket_path("/game"),
    )
    .await;

    let client = Client::connect(
        TransportKind::WebSocket,
        DialOptions::new(addr.to_string()).with_websocket_path("/game"),
        PacketPool::default(),
    )
    .await
    .unwrap();
    round_trip(&client, "over websocket").await;
    client.close().await;
    app.destroy().await;
}

#[tokio::test]
async fn websocket_wrong_path_is_refused() {
    let (app, addr, _) = echo_server(
        TransportKind::WebSocket,
        ListenOptions::new("127.0.0.1:0").with_websocket_path("/game"),
    )
    .await;

    let result = Client::connect(
        TransportKind::WebSocket,
        DialOptions::new(addr.to_string()).with_websocket_path("/admin"),
        PacketPool::default(),
    )
    .await;
    assert!(result.is_err());
    app.destroy().await;
}

#[tokio::test]
async fn websocket_uses_forwarded_address() {
    let (app, addr, peers) =
        echo_server(TransportKind::WebSocket, ListenOptions::new("127.0.0.1:0")).await;

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("X-Forwarded-For", "203.0.113.9, 10.0.0.1".parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    let pool = PacketPool::default();
    let body = Echo { text: "proxied".into() }.encode().unwrap();
    let frame = pool.build(OP_ECHO, &body).unwrap();
    ws.send(WsMessage::Binary(frame.as_bytes().to_vec()))
        .await
        .unwrap();

    let reply = loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Binary(data) => break pool.parse(&data).unwrap(),
            _ => continue,
        }
    };
    assert_eq!(reply.opcode(), OP_ECHO);
    assert_eq!(peers.lock().unwrap().as_slice(), ["203.0.113.9"]);
    app.destroy().await;
}

#[tokio::test]
async fn kcp_echo() {
    let (app, addr, _) =
        echo_server(TransportKind::Kcp, ListenOptions::new("127.0.0.1:0")).await;

    let client = Client::connect(
        TransportKind::Kcp,
        DialOptions::new(addr.to_string()),
        PacketPool::default(),
    )
    .await
    .unwrap();
    round_trip(&client, "over kcp").await;
    client.close().await;
    app.destroy().await;
}

#[tokio::test]
async fn websocket_oversized_message_closes_connection() {
    let (app, addr, peers) =
        echo_server(TransportKind::WebSocket, ListenOptions::new("127.0.0.1:0")).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws.send(WsMessage::Binary(vec![0u8; 4 + 65535 + 1]))
        .await
        .unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "server should drop the connection");
    assert!(peers.lock().unwrap().is_empty());
    app.destroy().await;
}
