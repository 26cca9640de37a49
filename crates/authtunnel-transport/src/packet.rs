//! UDP packet I/O contract between the session manager and UDP tunnelers

use crate::TunnelResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

/// A UDP payload and the peer it came from or goes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    pub addr: SocketAddr,
    pub payload: Bytes,
}

impl UdpPacket {
    pub fn new(addr: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            addr,
            payload: payload.into(),
        }
    }
}

/// Source of local packets
#[async_trait]
pub trait PacketReader: Send + Sync {
    /// Next packet, or `None` once the source is closed
    async fn read_packet(&self) -> TunnelResult<Option<UdpPacket>>;
}

/// Sink for packets coming back from the destination
#[async_trait]
pub trait PacketWriter: Send + Sync {
    /// Deliver a payload to the local peer
    async fn write_packet(&self, payload: Bytes) -> TunnelResult<()>;
}

/// Both halves of local packet I/O
pub trait PacketConn: PacketReader + PacketWriter {}

impl<T: PacketReader + PacketWriter> PacketConn for T {}
