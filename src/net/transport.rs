//! Transport: an ordered reliable byte stream carrying ACIP packets.
//!
//! Direct TCP, hole-punched P2P, and relayed streams all end up here; the
//! only behavioral difference is the per-packet payload cap.

use crate::codec::{self, CodecError, RawPacket, MAX_DATACHANNEL_PAYLOAD, MAX_PAYLOAD_SIZE};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} timed out after {budget_ms} ms")]
    ConnectTimeout { addr: SocketAddr, budget_ms: u64 },

    #[error("connection reset")]
    ConnectionReset,

    #[error("{0} unreachable")]
    Unreachable(SocketAddr),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay refused the bind")]
    RelayRefused,
}

/// How the stream to the peer was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plain TCP to a published address.
    DirectTcp,
    /// Hole-punched peer-to-peer stream; datagram-sized frames only.
    P2pDatachannel,
    /// Stream relayed through a rendezvous server.
    Relayed,
}

impl TransportKind {
    /// Per-packet payload cap for this transport flavor.
    pub fn payload_cap(&self) -> usize {
        match self {
            TransportKind::DirectTcp | TransportKind::Relayed => MAX_PAYLOAD_SIZE,
            TransportKind::P2pDatachannel => MAX_DATACHANNEL_PAYLOAD,
        }
    }
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// An established packet stream to one peer.
pub struct Transport {
    kind: TransportKind,
    peer_addr: SocketAddr,
    reader: BoxedRead,
    writer: BoxedWrite,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl Transport {
    pub fn direct(stream: TcpStream) -> std::io::Result<Self> {
        Self::from_tcp(stream, TransportKind::DirectTcp)
    }

    pub fn datachannel(stream: TcpStream) -> std::io::Result<Self> {
        Self::from_tcp(stream, TransportKind::P2pDatachannel)
    }

    pub fn relayed(stream: TcpStream) -> std::io::Result<Self> {
        Self::from_tcp(stream, TransportKind::Relayed)
    }

    fn from_tcp(stream: TcpStream, kind: TransportKind) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        // Frames are small and latency-sensitive; coalescing hurts.
        stream.set_nodelay(true).ok();
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            kind,
            peer_addr,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    /// Build from an arbitrary duplex pair; used by in-process tests.
    pub fn from_duplex<S>(stream: S, kind: TransportKind, peer_addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            kind,
            peer_addr,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn read_packet(&mut self) -> Result<RawPacket, TransportError> {
        Ok(codec::read_packet(&mut self.reader, self.kind.payload_cap()).await?)
    }

    pub async fn write_packet(
        &mut self,
        packet_type: u16,
        payload: &[u8],
        source_id: u32,
    ) -> Result<(), TransportError> {
        if payload.len() > self.kind.payload_cap() {
            return Err(TransportError::Codec(CodecError::LengthOverflow {
                got: payload.len(),
                cap: self.kind.payload_cap(),
            }));
        }
        Ok(codec::write_packet(&mut self.writer, packet_type, payload, source_id).await?)
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        use tokio::io::AsyncWriteExt;
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Split into independently-owned halves for the reader/writer tasks.
    pub fn split(self) -> (TransportReader, TransportWriter) {
        (
            TransportReader {
                kind: self.kind,
                reader: self.reader,
            },
            TransportWriter {
                kind: self.kind,
                writer: self.writer,
            },
        )
    }
}

pub struct TransportReader {
    kind: TransportKind,
    reader: BoxedRead,
}

impl TransportReader {
    pub async fn read_packet(&mut self) -> Result<RawPacket, TransportError> {
        Ok(codec::read_packet(&mut self.reader, self.kind.payload_cap()).await?)
    }
}

pub struct TransportWriter {
    kind: TransportKind,
    writer: BoxedWrite,
}

impl TransportWriter {
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        use tokio::io::AsyncWriteExt;
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn payload_cap(&self) -> usize {
        self.kind.payload_cap()
    }
}

/// Direct TCP connect with a hard budget.
pub async fn connect_direct(addr: SocketAddr, budget: Duration) -> Result<Transport, TransportError> {
    match tokio::time::timeout(budget, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(Transport::direct(stream)?),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(TransportError::Unreachable(addr))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::ConnectTimeout {
            addr,
            budget_ms: budget.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_packet_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut transport = Transport::direct(stream).unwrap();
            let packet = transport.read_packet().await.unwrap();
            assert_eq!(packet.packet_type, 5001);
            transport.write_packet(5002, &packet.payload, 0).await.unwrap();
        });

        let mut client = connect_direct(addr, Duration::from_secs(3)).await.unwrap();
        client.write_packet(5001, b"nonce", 7).await.unwrap();
        let reply = client.read_packet().await.unwrap();
        assert_eq!(reply.packet_type, 5002);
        assert_eq!(reply.payload, b"nonce");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn datachannel_enforces_16k_cap() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut left = Transport::from_duplex(a, TransportKind::P2pDatachannel, addr);
        let _right = Transport::from_duplex(b, TransportKind::P2pDatachannel, addr);

        let oversize = vec![0u8; MAX_DATACHANNEL_PAYLOAD + 1];
        assert!(left.write_packet(3001, &oversize, 1).await.is_err());
    }

    #[tokio::test]
    async fn refused_connect_is_unreachable() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match connect_direct(addr, Duration::from_secs(3)).await {
            Err(TransportError::Unreachable(a)) => assert_eq!(a, addr),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }
}
