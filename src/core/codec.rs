//! Tokio codec for the opcode frame format over byte streams.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::packet::{decode_header, Packet, PacketPool, HEADER_LEN};
use crate::error::{ProtocolError, Result};

/// Frames [`Packet`]s on stream transports (TCP, KCP, TLS over either).
///
/// Decoded packets are drawn from the codec's [`PacketPool`]; encoded packets
/// are freed back to their pool once copied into the write buffer.
#[derive(Clone, Default)]
pub struct PacketCodec {
    pool: PacketPool,
}

impl PacketCodec {
    pub fn new(pool: PacketPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    fn missing(src: &BytesMut) -> usize {
        match decode_header(src) {
            Some((body_len, _)) => HEADER_LEN + body_len as usize,
            None => HEADER_LEN,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let Some((body_len, _)) = decode_header(src) else {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        };

        let total = HEADER_LEN + body_len as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        self.pool.parse(&frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => Err(ProtocolError::ShortRead {
                expected: Self::missing(buf),
                received: buf.len(),
            }),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.as_bytes().len());
        dst.extend_from_slice(item.as_bytes());
        item.free()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_header_waits() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0u8, 2][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_partial_body_waits_then_completes() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0u8, 2, 0, 9, 1][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[2]);
        let packet = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.opcode(), 9);
        assert_eq!(packet.body(), &[1, 2]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_eof_mid_frame_is_short_read() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::from(&[0u8, 8, 0, 9, 1, 2][..]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ShortRead {
                expected: 12,
                received: 6
            }
        ));
    }

    #[test]
    fn test_eof_on_clean_boundary() {
        let mut codec = PacketCodec::default();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_encode_frees_packet() {
        let pool = PacketPool::new(0);
        let mut codec = PacketCodec::new(pool.clone());
        let packet = pool.build(3, b"xy").unwrap();

        let mut dst = BytesMut::new();
        codec.encode(packet, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0, 2, 0, 3, b'x', b'y']);
        assert_eq!(pool.outstanding(), 0);
    }
}
