//! # Service Layer
//!
//! The server runtime and a matching client.
//!
//! ## Components
//! - **App**: accept loop, grace window, dispatch and server-initiated actions
//! - **Module**: user lifecycle units that register routes
//! - **Client**: dials a server and exchanges packets

pub mod app;
pub mod client;
pub mod module;

pub use app::{App, SessionHook};
pub use client::Client;
pub use module::Module;
