//! HTTP/1.1 tunneler
//!
//! TCP traffic uses a literal `CONNECT host:port HTTP/1.1` request. UDP
//! traffic uses a `GET` to the well-known MASQUE path with
//! `Upgrade: connect-udp`, after which both directions carry HTTP capsules.
//!
//! This is the only tunneler that works without TLS, so it ends every
//! fallback chain.

mod handshake;
mod tcp;
mod udp;

pub use handshake::Rewind;

use authtunnel_transport::{with_alpn, LocalStream, ProxyTarget, TunnelResult};

/// HTTP/1.1 CONNECT and CONNECT-UDP tunneler
#[derive(Debug, Clone)]
pub struct Http1Tunneler {
    target: ProxyTarget,
}

impl Http1Tunneler {
    pub fn new(target: ProxyTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Dial the proxy, with TLS when configured
    async fn dial(&self) -> TunnelResult<Box<dyn LocalStream>> {
        match &self.target.tls {
            Some(config) => {
                let config = with_alpn(config, &[b"http/1.1"]);
                Ok(Box::new(self.target.dial_tls(config).await?))
            }
            None => Ok(Box::new(self.target.dial_tcp().await?)),
        }
    }
}
