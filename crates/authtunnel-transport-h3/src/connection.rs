//! QUIC dialing and the HTTP/3 connection driver

use authtunnel_transport::{ProxyTarget, TunnelError, TunnelResult};
use bytes::Bytes;
use futures::future::poll_fn;
use h3::ConnectionState;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::quic_client_config;

pub(crate) type SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;
pub(crate) type RequestStream = h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// Quarter stream ID of the first client bidirectional stream
pub(crate) const FIRST_QUARTER_STREAM_ID: u64 = 0;

/// How long to wait for the proxy's SETTINGS frame
const SETTINGS_TIMEOUT: Duration = Duration::from_secs(1);
const SETTINGS_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub(crate) fn h3_error(context: &str, e: impl std::fmt::Display) -> TunnelError {
    TunnelError::ConnectionError(format!("{}: {}", context, e))
}

/// One QUIC connection carrying one HTTP/3 tunnel
pub(crate) struct Http3Connection {
    pub quic: quinn::Connection,
    pub send_request: SendRequest,
    driver: JoinHandle<()>,
    _endpoint: quinn::Endpoint,
}

impl Drop for Http3Connection {
    fn drop(&mut self) {
        self.driver.abort();
        self.quic.close(quinn::VarInt::from_u32(0), b"tunnel closed");
    }
}

impl Http3Connection {
    /// Dial the proxy over QUIC and complete the HTTP/3 handshake
    pub async fn dial(target: &ProxyTarget, tls: &rustls::ClientConfig) -> TunnelResult<Self> {
        let config = quic_client_config(tls)?;

        let addr = tokio::net::lookup_host(&target.proxy_host)
            .await
            .map_err(|e| h3_error("Failed to resolve proxy", e))?
            .next()
            .ok_or_else(|| {
                TunnelError::ConnectionError(format!("No address for {}", target.proxy_host))
            })?;
        let bind_addr = if addr.is_ipv6() {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        };

        debug!("Dialing proxy {} over QUIC ({})", target.proxy_host, addr);
        let endpoint = quinn::Endpoint::client(bind_addr)?;
        let quic = endpoint
            .connect_with(config, addr, target.proxy_hostname())
            .map_err(|e| h3_error("QUIC connect failed", e))?
            .await
            .map_err(|e| h3_error("QUIC handshake failed", e))?;

        let mut builder = h3::client::builder();
        builder.enable_extended_connect(true).enable_datagram(true);
        let (mut driver, send_request) = builder
            .build::<_, _, Bytes>(h3_quinn::Connection::new(quic.clone()))
            .await
            .map_err(|e| h3_error("H3 handshake failed", e))?;

        let driver = tokio::spawn(async move {
            let closed = poll_fn(|cx| driver.poll_close(cx)).await;
            debug!("H3 connection closed: {:?}", closed);
        });

        Ok(Self {
            quic,
            send_request,
            driver,
            _endpoint: endpoint,
        })
    }

    /// Wait until the proxy's SETTINGS allow CONNECT-UDP: extended CONNECT
    /// and HTTP datagrams, on a QUIC connection that carries datagrams.
    ///
    /// Settings that never arrive count as disabled.
    pub async fn require_connect_udp(&self) -> TunnelResult<()> {
        if self.quic.max_datagram_size().is_none() {
            return Err(TunnelError::Unsupported(
                "proxy does not accept QUIC datagrams".to_string(),
            ));
        }

        let deadline = Instant::now() + SETTINGS_TIMEOUT;
        loop {
            let settings = self.send_request.settings();
            if settings.enable_extended_connect() && settings.enable_datagram() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::Unsupported(format!(
                    "proxy settings do not allow connect-udp (extended connect: {}, datagrams: {})",
                    settings.enable_extended_connect(),
                    settings.enable_datagram()
                )));
            }
            tokio::time::sleep(SETTINGS_POLL_INTERVAL).await;
        }
    }
}
