//! Protocol selection by probing the proxy

use crate::fallback::{FallbackTcpTunneler, FallbackUdpTunneler};
use authtunnel_transport::{http_get, ProxyTarget, TcpTunneler, UdpTunneler};
use authtunnel_transport_h1::Http1Tunneler;
use authtunnel_transport_h2::Http2Tunneler;
use authtunnel_transport_h3::Http3Tunneler;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Best HTTP version the proxy is known to support
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    Http3,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http1 => write!(f, "http1"),
            Protocol::Http2 => write!(f, "http2"),
            Protocol::Http3 => write!(f, "http3"),
        }
    }
}

/// Probe the proxy root.
///
/// Cleartext proxies and failed probes mean HTTP/1.1. Otherwise an `Alt-Svc`
/// advertising `h3` wins over a negotiated HTTP/2.
pub async fn probe_protocol(target: &ProxyTarget, timeout: Duration) -> Protocol {
    if !target.is_tls() {
        info!("tls not enabled, using http1");
        return Protocol::Http1;
    }

    let response = match http_get(target, "/", timeout).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "failed to make probe request, falling back to http1");
            return Protocol::Http1;
        }
    };

    if response.advertises_h3() {
        Protocol::Http3
    } else if response.is_http2() {
        Protocol::Http2
    } else {
        Protocol::Http1
    }
}

/// TCP tunnelers to try, best first, always ending in HTTP/1.1
pub fn tcp_chain(target: &ProxyTarget, protocol: Protocol) -> Vec<Arc<dyn TcpTunneler>> {
    let mut chain: Vec<Arc<dyn TcpTunneler>> = Vec::with_capacity(3);
    if protocol == Protocol::Http3 {
        chain.push(Arc::new(Http3Tunneler::new(target.clone())));
    }
    if matches!(protocol, Protocol::Http3 | Protocol::Http2) {
        chain.push(Arc::new(Http2Tunneler::new(target.clone())));
    }
    chain.push(Arc::new(Http1Tunneler::new(target.clone())));
    chain
}

/// UDP tunnelers to try; there is no HTTP/2 UDP tunneler
pub fn udp_chain(target: &ProxyTarget, protocol: Protocol) -> Vec<Arc<dyn UdpTunneler>> {
    let mut chain: Vec<Arc<dyn UdpTunneler>> = Vec::with_capacity(2);
    if protocol == Protocol::Http3 {
        chain.push(Arc::new(Http3Tunneler::new(target.clone())));
    }
    chain.push(Arc::new(Http1Tunneler::new(target.clone())));
    chain
}

/// Probe once and build the TCP fallback chain
pub async fn pick_tcp_tunneler(target: &ProxyTarget, timeout: Duration) -> Arc<dyn TcpTunneler> {
    let protocol = probe_protocol(target, timeout).await;
    info!(proxy = %target.proxy_host, "pick-tcp-tunneler: using {}", protocol);
    Arc::new(FallbackTcpTunneler::new(tcp_chain(target, protocol)))
}

/// Probe once and build the UDP fallback chain
pub async fn pick_udp_tunneler(target: &ProxyTarget, timeout: Duration) -> Arc<dyn UdpTunneler> {
    let mut protocol = probe_protocol(target, timeout).await;
    if protocol == Protocol::Http2 {
        protocol = Protocol::Http1;
    }
    info!(proxy = %target.proxy_host, "pick-udp-tunneler: using {}", protocol);
    Arc::new(FallbackUdpTunneler::new(udp_chain(target, protocol)))
}
