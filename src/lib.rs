//! # gamenet
//!
//! Network runtime for game servers. Clients connect over TCP (optionally
//! TLS), KCP or WebSocket and exchange opcode-tagged binary frames. Each
//! connection becomes a [`Session`](session::Session) that must authenticate
//! within a grace window; authenticated sessions are indexed by user id so
//! the server can push messages to them.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use gamenet::config::ServerConfig;
//! use gamenet::core::message::{Message, MessageType};
//! use gamenet::protocol::{handler, RegisterParams};
//! use gamenet::service::App;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Login {
//!     user_id: u64,
//! }
//!
//! impl Message for Login {
//!     const TYPE: MessageType = MessageType::new("account.Login");
//! }
//!
//! # async fn run() -> gamenet::error::Result<()> {
//! let app = App::new(&ServerConfig::default()).await?;
//! app.register::<Login>(
//!     1u16,
//!     RegisterParams::new()
//!         .with_skip_validation()
//!         .with_handler(handler(|ctx| async move {
//!             let login: Login = ctx.bind()?;
//!             ctx.session().set_identity(login.user_id)
//!         })),
//! )?;
//! app.run_until(Vec::new(), async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod utils;

pub use crate::config::NetworkConfig;
pub use crate::core::message::{Message, MessageType};
pub use crate::core::packet::{Packet, PacketPool};
pub use crate::error::{ProtocolError, Result};
pub use crate::service::{App, Client, Module};
pub use crate::session::Session;
pub use crate::transport::TransportKind;
