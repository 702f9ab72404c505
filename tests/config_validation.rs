//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use gamenet::config::{ClientConfig, NetworkConfig, ServerConfig, TlsFiles};
use gamenet::transport::{ConnTimeouts, KcpMode, TransportKind};
use gamenet::ProtocolError;
use tempfile::tempdir;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_defaults_match_documented_values() {
    let server = ServerConfig::default();
    assert_eq!(server.network, TransportKind::Tcp);
    assert_eq!(server.kcp_mode, KcpMode::Fast);
    assert_eq!(server.websocket_path, "/ws");
    assert_eq!(server.auth_timeout, Duration::from_secs(10));
    assert!(server.tls.is_none());
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_zero_auth_timeout_rejected() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.auth_timeout = Duration::ZERO;
    });
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Authentication timeout must be greater than 0")));
}

#[test]
fn test_zero_read_timeout_is_allowed() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.read_timeout = Duration::ZERO;
        c.client.read_timeout = Duration::ZERO;
    });
    assert!(config.validate().is_empty());
    assert!(config.server.timeouts().read.is_none());
}

#[test]
fn test_websocket_path_must_be_absolute() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.websocket_path = "ws".to_string();
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("WebSocket path must start with '/'")));
}

#[test]
fn test_tls_requires_both_files() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.tls = Some(TlsFiles {
            cert_file: "cert.pem".to_string(),
            key_file: String::new(),
        });
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("TLS requires both cert_file and key_file")));
}

#[test]
fn test_validate_strict_collects_every_error() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = String::new();
        c.server.max_connections = 0;
        c.logging.app_name = String::new();
    });

    let err = config.validate_strict().unwrap_err();
    let ProtocolError::ConfigError(message) = err else {
        panic!("expected a config error");
    };
    assert!(message.contains("Server address cannot be empty"));
    assert!(message.contains("Max connections must be greater than 0"));
    assert!(message.contains("Application name cannot be empty"));
}

#[test]
fn test_from_toml() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "0.0.0.0:7000"
        network = "ws"
        websocket_path = "/play"
        kcp_mode = "normal"
        auth_timeout = 3
        read_timeout = 0

        [logging]
        log_level = "debug"
        json_format = true
        "#,
    )
    .unwrap();

    assert_eq!(config.server.address, "0.0.0.0:7000");
    assert_eq!(config.server.network, TransportKind::WebSocket);
    assert_eq!(config.server.websocket_path, "/play");
    assert_eq!(config.server.kcp_mode, KcpMode::Normal);
    assert_eq!(config.server.auth_timeout, Duration::from_secs(3));
    assert_eq!(config.server.read_timeout, Duration::ZERO);
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.logging.json_format);
}

#[test]
fn test_unknown_network_rejected() {
    let result = NetworkConfig::from_toml(
        r#"
        [server]
        network = "quic"
        "#,
    );
    assert!(result.is_err());
}

#[test]
fn test_save_and_reload() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gamenet.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.network = TransportKind::Kcp;
        c.server.max_connections = 64;
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.server.network, TransportKind::Kcp);
    assert_eq!(loaded.server.max_connections, 64);
    assert!(loaded.validate().is_empty());
}

#[test]
fn test_missing_file() {
    let result = NetworkConfig::from_file("/nonexistent/gamenet.toml");
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert_eq!(parsed.server.address, ServerConfig::default().address);
}

#[test]
fn test_listen_options_carry_settings() {
    let server = ServerConfig {
        websocket_path: "/game".to_string(),
        kcp_mode: KcpMode::Normal,
        ..ServerConfig::default()
    };
    let options = server.listen_options().unwrap();
    assert_eq!(options.address, server.address);
    assert_eq!(options.websocket_path, "/game");
    assert_eq!(options.kcp_mode, KcpMode::Normal);
    assert!(options.tls.is_none());
}

#[test]
fn test_listen_options_fail_on_missing_tls_files() {
    let server = ServerConfig {
        tls: Some(TlsFiles {
            cert_file: "/nonexistent/cert.pem".to_string(),
            key_file: "/nonexistent/key.pem".to_string(),
        }),
        ..ServerConfig::default()
    };
    assert!(server.listen_options().is_err());
}

#[test]
fn test_dial_options_carry_settings() {
    let client = ClientConfig {
        address: "game.example.com:9000".to_string(),
        websocket_path: "/game".to_string(),
        kcp_mode: KcpMode::Normal,
        read_timeout: Duration::ZERO,
        write_timeout: Duration::from_secs(3),
        ..ClientConfig::default()
    };
    let options = client.dial_options().unwrap();
    assert_eq!(options.address, "game.example.com:9000");
    assert_eq!(options.websocket_path, "/game");
    assert_eq!(options.kcp_mode, KcpMode::Normal);
    assert_eq!(
        options.timeouts,
        ConnTimeouts::new(Duration::ZERO, Duration::from_secs(3))
    );
    assert_eq!(options.timeouts.read, None);
    assert!(options.tls.is_none());
}

#[test]
fn test_dial_options_enable_tls_with_server_name() {
    let client = ClientConfig {
        tls_server_name: Some("localhost".to_string()),
        tls_insecure: true,
        ..ClientConfig::default()
    };
    let options = client.dial_options().unwrap();
    assert!(options.tls.is_some());
}

// The only test in this binary that touches GAMENET_* variables
#[test]
fn test_from_env_overrides() {
    let vars = [
        ("GAMENET_SERVER_ADDRESS", "0.0.0.0:7000"),
        ("GAMENET_NETWORK", "kcp"),
        ("GAMENET_KCP_MODE", "normal"),
        ("GAMENET_MAX_CONNECTIONS", "250"),
        ("GAMENET_AUTH_TIMEOUT_SECS", "4"),
        ("GAMENET_READ_TIMEOUT_SECS", "0"),
        ("GAMENET_WRITE_TIMEOUT_SECS", "not-a-number"),
    ];
    for (key, value) in vars {
        std::env::set_var(key, value);
    }

    let config = NetworkConfig::from_env().unwrap();
    assert_eq!(config.server.address, "0.0.0.0:7000");
    assert_eq!(config.server.network, TransportKind::Kcp);
    assert_eq!(config.client.network, TransportKind::Kcp);
    assert_eq!(config.server.kcp_mode, KcpMode::Normal);
    assert_eq!(config.client.kcp_mode, KcpMode::Normal);
    assert_eq!(config.server.max_connections, 250);
    assert_eq!(config.server.auth_timeout, Duration::from_secs(4));
    assert_eq!(config.server.read_timeout, Duration::ZERO);
    // Unparseable numbers keep the default
    assert_eq!(
        config.server.write_timeout,
        ServerConfig::default().write_timeout
    );
    assert!(config.validate().is_empty());

    std::env::set_var("GAMENET_NETWORK", "quic");
    assert!(matches!(
        NetworkConfig::from_env(),
        Err(ProtocolError::UnsupportedTransport(_))
    ));

    for (key, _) in vars {
        std::env::remove_var(key);
    }
    let defaults = NetworkConfig::from_env().unwrap();
    assert_eq!(defaults.server.address, ServerConfig::default().address);
}
