//! HTTP/2 CONNECT tunneler
//!
//! Each tunnel dials its own TLS connection negotiating `h2` via ALPN and
//! opens a single CONNECT stream to the destination. DATA frames carry the
//! tunneled bytes; END_STREAM half-closes the local side.
//!
//! HTTP/2 is only attempted over TLS. A cleartext proxy, or one that does not
//! select `h2`, yields [`TunnelError::Unsupported`] so a fallback chain can
//! move on to HTTP/1.1.
//!
//! [`TunnelError::Unsupported`]: authtunnel_transport::TunnelError::Unsupported

mod connection;
mod stream;

pub use connection::Http2Tunneler;
