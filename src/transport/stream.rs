//! Packet connection over any async byte stream.
//!
//! TCP, KCP (stream mode), TLS over either, and in-memory duplex pipes all
//! share this implementation; only the construction of the stream differs.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, PacketPool};
use crate::error::{ProtocolError, Result};
use crate::transport::{ConnTimeouts, Connection};
use crate::utils::timeout::{close_deadline, with_deadline};

/// [`Connection`] framing packets with [`PacketCodec`] over a split stream.
pub struct StreamConnection<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, PacketCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, PacketCodec>>,
    real_ip: String,
    timeouts: ConnTimeouts,
    closed: CancellationToken,
    close_started: AtomicBool,
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, real_ip: String, timeouts: ConnTimeouts, pool: PacketPool) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let codec = PacketCodec::new(pool);

        Self {
            reader: Mutex::new(FramedRead::new(read_half, codec.clone())),
            writer: Mutex::new(FramedWrite::new(write_half, codec)),
            real_ip,
            timeouts,
            closed: CancellationToken::new(),
            close_started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_packet(&self) -> Result<Packet> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut reader = self.reader.lock().await;
        let next = async { reader.next().await.transpose() };

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = with_deadline(self.timeouts.read, next) => {
                result?.ok_or(ProtocolError::ConnectionClosed)
            }
        }
    }

    async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = with_deadline(self.timeouts.write, writer.send(packet)) => result,
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
        if let Err(e) = with_deadline(close_deadline(self.timeouts), SinkExt::close(&mut *writer)).await {
            debug!(peer = %self.real_ip, error = %e, "Error while shutting down stream");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
