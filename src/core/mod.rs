//! # Core Protocol Components
//!
//! Low-level frame handling: packet layout, pooled buffers, the stream codec
//! and typed message bodies.
//!
//! ## Components
//! - **Packet**: opcode-tagged frame backed by a pooled buffer
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Message**: typed bodies keyed by a stable message type
//!
//! ## Wire Format
//! ```text
//! [BodyLength(2, BE)] [Opcode(2, BE)] [Body(BodyLength)]
//! ```
//!
//! Opcode 0 is reserved and never dispatched. Bodies are at most 65535 bytes.

pub mod codec;
pub mod message;
pub mod packet;
