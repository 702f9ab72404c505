//! Frame layout and the pool that owns frame buffers.
//!
//! ```text
//! [body_length: u16 BE][opcode: u16 BE][body: body_length bytes]
//! ```

use std::fmt;

use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::{BufferPool, PooledBuffer};

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 4;

/// Largest body a frame can carry
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Reserved opcode; never routed
pub const NO_OPCODE: u16 = 0;

/// Decode `(body_length, opcode)` from the first four bytes of `bytes`.
#[inline]
pub fn decode_header(bytes: &[u8]) -> Option<(u16, u16)> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let body_len = u16::from_be_bytes([bytes[0], bytes[1]]);
    let opcode = u16::from_be_bytes([bytes[2], bytes[3]]);
    Some((body_len, opcode))
}

/// One immutable frame backed by a pooled buffer.
///
/// The buffer goes back to its pool through [`Packet::free`], or on drop.
pub struct Packet {
    buf: PooledBuffer,
}

impl Packet {
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn body_len(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    /// The complete wire representation, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Pool lease backing this packet
    pub fn lease(&self) -> u64 {
        self.buf.lease()
    }

    /// Return the buffer to the pool. The packet cannot be read afterwards.
    pub fn free(self) -> Result<()> {
        self.buf.release()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("opcode", &self.opcode())
            .field("body_len", &self.body_len())
            .field("lease", &self.lease())
            .finish()
    }
}

/// Builds and parses [`Packet`]s out of a shared [`BufferPool`].
#[derive(Clone, Default)]
pub struct PacketPool {
    buffers: BufferPool,
}

impl PacketPool {
    /// Create a pool with `idle` pre-allocated buffers
    pub fn new(idle: usize) -> Self {
        Self {
            buffers: BufferPool::new(idle),
        }
    }

    /// Frame `body` under `opcode`.
    pub fn build(&self, opcode: u16, body: &[u8]) -> Result<Packet> {
        if body.len() > MAX_BODY_LEN {
            return Err(ProtocolError::OversizedPacket(body.len()));
        }

        let mut buf = self.buffers.acquire(HEADER_LEN + body.len());
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&opcode.to_be_bytes());
        buf.extend_from_slice(body);
        Ok(Packet { buf })
    }

    /// Parse exactly one complete frame from `bytes`.
    ///
    /// Fewer bytes than the header declares is a short read; trailing bytes
    /// after the declared body are a malformed header.
    pub fn parse(&self, bytes: &[u8]) -> Result<Packet> {
        let (body_len, _) = decode_header(bytes).ok_or(ProtocolError::ShortRead {
            expected: HEADER_LEN,
            received: bytes.len(),
        })?;

        let total = HEADER_LEN + body_len as usize;
        if bytes.len() < total {
            return Err(ProtocolError::ShortRead {
                expected: total,
                received: bytes.len(),
            });
        }
        if bytes.len() > total {
            return Err(ProtocolError::InvalidHeader);
        }

        let mut buf = self.buffers.acquire(total);
        buf.extend_from_slice(bytes);
        Ok(Packet { buf })
    }

    /// Idle buffers ready for reuse
    pub fn available(&self) -> usize {
        self.buffers.available()
    }

    /// Packets currently alive
    pub fn outstanding(&self) -> usize {
        self.buffers.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_layout() {
        let pool = PacketPool::new(1);
        let packet = pool.build(0x0102, b"abc").unwrap();
        assert_eq!(packet.as_bytes(), &[0, 3, 1, 2, b'a', b'b', b'c']);
        assert_eq!(packet.opcode(), 0x0102);
        assert_eq!(packet.body_len(), 3);
        assert_eq!(packet.body(), b"abc");
    }

    #[test]
    fn test_parse_empty_body() {
        let pool = PacketPool::new(1);
        let packet = pool.parse(&[0, 0, 0, 100]).unwrap();
        assert_eq!(packet.opcode(), 100);
        assert!(packet.body().is_empty());
    }

    #[test]
    fn test_parse_short_header() {
        let pool = PacketPool::new(1);
        let err = pool.parse(&[0, 1]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 4,
                received: 2
            }
        ));
    }

    #[test]
    fn test_parse_short_body() {
        let pool = PacketPool::new(1);
        let err = pool.parse(&[0, 5, 0, 1, 9, 9]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 9,
                received: 6
            }
        ));
    }

    #[test]
    fn test_parse_trailing_bytes() {
        let pool = PacketPool::new(1);
        let err = pool.parse(&[0, 1, 0, 1, 9, 9]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHeader));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let pool = PacketPool::new(0);
        let body = vec![0u8; MAX_BODY_LEN + 1];
        assert!(matches!(
            pool.build(1, &body),
            Err(ProtocolError::OversizedPacket(n)) if n == MAX_BODY_LEN + 1
        ));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_free_returns_buffer() {
        let pool = PacketPool::new(0);
        let packet = pool.build(7, b"hello").unwrap();
        assert_eq!(pool.outstanding(), 1);
        packet.free().unwrap();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);

        // The recycled buffer comes back empty
        let again = pool.build(8, b"").unwrap();
        assert_eq!(again.as_bytes(), &[0, 0, 0, 8]);
    }
}
