#![no_main]

use bytes::BytesMut;
use gamenet::core::codec::PacketCodec;
use gamenet::core::packet::PacketPool;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let pool = PacketPool::new(4);
    let _ = pool.parse(data);

    // Stream decoding must never panic or spin on arbitrary input
    let mut codec = PacketCodec::new(pool);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_packet)) = codec.decode(&mut buf) {}
    let _ = codec.decode_eof(&mut buf);
});
