//! Transport abstraction layer for authenticated tunnels
//!
//! This crate provides the protocol-agnostic pieces shared by every tunneler:
//! the error taxonomy that drives fallback and authentication retry, the
//! `TcpTunneler`/`UdpTunneler` traits, the event sink observed by callers,
//! and the TLS and dialing helpers used to reach the proxy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            Tunnel orchestrator (authtunnel-client)       │
//! │   JWT cache, login retry, protocol picker, fallback      │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │          authtunnel-transport (this crate)               │
//! │  - TcpTunneler          - UdpTunneler                    │
//! │  - EventSink            - PacketReader / PacketWriter    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────┬──────────────────┬──────────────────┐
//! │ transport-h1     │ transport-h2     │ transport-h3     │
//! │ CONNECT,         │ CONNECT          │ extended CONNECT,│
//! │ Upgrade: udp     │                  │ QUIC datagrams   │
//! └──────────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! # Error semantics
//!
//! Tunnelers classify proxy responses at their boundary. The classification
//! travels unchanged through the fallback and orchestrator layers:
//!
//! - [`TunnelError::Unsupported`] moves a fallback chain to its next entry
//! - [`TunnelError::Unauthenticated`] triggers one login and one retry
//! - [`TunnelError::Unavailable`] and [`TunnelError::Unauthorized`] keep the
//!   cached token
//! - everything else invalidates the cached token

pub mod error;
pub mod events;
pub mod packet;
pub mod probe;
pub mod relay;
pub mod target;
pub mod tls;

pub use error::{classify_status, TunnelError, TunnelResult};
pub use events::{DiscardEvents, EventSink, LogEvents};
pub use packet::{PacketConn, PacketReader, PacketWriter, UdpPacket};
pub use probe::{http_get, ProbeResponse};
pub use relay::{relay, with_cancel};
pub use target::ProxyTarget;
pub use tls::{ensure_crypto_provider, with_alpn, TlsOptions};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// A local byte stream handed to a TCP tunneler
pub trait LocalStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LocalStream for T {}

/// Tunnels a local byte stream to the destination through the proxy
///
/// Implementations emit `on_connecting` before dialing, `on_connected` after
/// the proxy accepted the CONNECT, and `on_disconnected` once the data plane
/// stops. Nothing is forwarded before the handshake completes.
#[async_trait]
pub trait TcpTunneler: Send + Sync {
    /// Short protocol name used in logs
    fn name(&self) -> &'static str;

    /// Run one tunnel attempt with the given bearer token (may be empty)
    ///
    /// Returns `Ok(())` when either side closed cleanly and
    /// [`TunnelError::Cancelled`] when `cancel` fired.
    async fn tunnel_tcp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &mut dyn LocalStream,
        token: &str,
    ) -> TunnelResult<()>;
}

/// Tunnels local UDP packets to the destination through the proxy
#[async_trait]
pub trait UdpTunneler: Send + Sync {
    /// Short protocol name used in logs
    fn name(&self) -> &'static str;

    /// Run one tunnel attempt with the given bearer token (may be empty)
    async fn tunnel_udp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &dyn PacketConn,
        token: &str,
    ) -> TunnelResult<()>;
}
