//! HTTP/3 tunnelers for authenticated tunnels
//!
//! TCP tunnels use a plain CONNECT on a QUIC request stream. UDP tunnels use
//! extended CONNECT with `:protocol = connect-udp` and then move payloads as
//! QUIC datagrams; the request stream only stays open to keep the session
//! alive and anything the proxy sends on it is discarded.
//!
//! Every tunnel dials its own QUIC connection, so the CONNECT-UDP request is
//! always the first client bidirectional stream and its quarter stream ID is 0.

mod config;
mod connection;
mod tcp;
mod udp;

pub use config::{quic_client_config, INITIAL_MTU};

use authtunnel_transport::ProxyTarget;

/// HTTP/3 tunneler for TCP and UDP
#[derive(Debug, Clone)]
pub struct Http3Tunneler {
    target: ProxyTarget,
}

impl Http3Tunneler {
    pub fn new(target: ProxyTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }
}
