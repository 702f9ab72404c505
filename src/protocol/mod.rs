//! # Routing
//!
//! Maps inbound opcodes and message types to handlers wrapped in middleware.
//!
//! ## Components
//! - **Opcode**: checked coercion of integer kinds to 16-bit opcodes
//! - **Router**: inbound, internal and outbound route tables
//! - **Middleware**: handler composition and the session validity check
//! - **Context**: per-request view of the session and packet

pub mod context;
pub mod middleware;
pub mod opcode;
pub mod router;

pub use context::Context;
pub use middleware::{handler, middleware, validate_session, Handler, HandlerFuture, Middleware};
pub use opcode::RawOpcode;
pub use router::{RegisterParams, Route, Router};
