//! Client side of authenticated tunnels
//!
//! [`Tunnel`] ties the pieces together: it picks the best transport the proxy
//! supports (HTTP/3, HTTP/2 or HTTP/1.1, falling back on `unsupported`),
//! attaches the cached bearer token, logs in once when the proxy asks for
//! authentication, and serves local TCP connections or UDP peers.
//!
//! ```no_run
//! use authtunnel_client::{Tunnel, TunnelConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TunnelConfig::from_urls("redis.example.com:6379", "")?;
//! let tunnel = Arc::new(Tunnel::new(config)?);
//! tunnel
//!     .run_listener(&CancellationToken::new(), "127.0.0.1:6379")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod fallback;
pub mod picker;
pub mod tunnel;
pub mod udp_session;

pub use backoff::{Backoff, BackoffConfig};
pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use fallback::{Fallback, FallbackTcpTunneler, FallbackUdpTunneler};
pub use picker::{pick_tcp_tunneler, pick_udp_tunneler, probe_protocol, Protocol};
pub use tunnel::{AttemptHandler, Tunnel};
pub use udp_session::{PacketQueue, SessionHandler, UdpSession, UdpSessionManager};

// Re-export the pieces callers need to drive a tunnel
pub use authtunnel_auth::{JwtCache, LocalJwtCache, MemoryJwtCache};
pub use authtunnel_transport::{
    DiscardEvents, EventSink, LogEvents, TlsOptions, TunnelError, TunnelResult,
};
