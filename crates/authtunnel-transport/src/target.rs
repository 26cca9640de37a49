//! Proxy dialing target shared by all tunnelers

use crate::{TunnelError, TunnelResult};
use authtunnel_proto::split_host_port;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Destination and proxy of one tunnel
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    /// `host:port` the proxy should connect to
    pub destination: String,

    /// `host:port` of the proxy itself
    pub proxy_host: String,

    /// TLS settings; `None` dials the proxy in cleartext
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl ProxyTarget {
    pub fn new(
        destination: impl Into<String>,
        proxy_host: impl Into<String>,
        tls: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        Self {
            destination: destination.into(),
            proxy_host: proxy_host.into(),
            tls,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Key under which the proxy's token is cached
    pub fn cache_key(&self) -> String {
        format!("{}|{}", self.proxy_host, self.is_tls())
    }

    /// Base URL of the proxy, used for the login flow
    pub fn server_url(&self) -> String {
        let scheme = if self.is_tls() { "https" } else { "http" };
        format!("{}://{}", scheme, self.proxy_host)
    }

    /// Request authority of the proxy; the scheme's default port is omitted
    pub fn authority(&self) -> &str {
        let default_port = if self.is_tls() { "443" } else { "80" };
        match split_host_port(&self.proxy_host) {
            Some((_, port)) if port == default_port => {
                &self.proxy_host[..self.proxy_host.len() - port.len() - 1]
            }
            _ => &self.proxy_host,
        }
    }

    /// Proxy host name without the port
    pub fn proxy_hostname(&self) -> &str {
        split_host_port(&self.proxy_host)
            .map(|(host, _)| host)
            .unwrap_or(&self.proxy_host)
    }

    /// Destination split into host and port
    pub fn destination_parts(&self) -> TunnelResult<(&str, &str)> {
        split_host_port(&self.destination).ok_or_else(|| {
            TunnelError::ConfigurationError(format!("invalid destination: {}", self.destination))
        })
    }

    /// TLS server name of the proxy
    pub fn server_name(&self) -> TunnelResult<ServerName<'static>> {
        ServerName::try_from(self.proxy_hostname().to_string())
            .map_err(|e| TunnelError::TlsError(format!("Invalid server name: {}", e)))
    }

    /// Open a TCP connection to the proxy
    pub async fn dial_tcp(&self) -> TunnelResult<TcpStream> {
        debug!("Dialing proxy {}", self.proxy_host);
        let stream = TcpStream::connect(&self.proxy_host).await.map_err(|e| {
            TunnelError::ConnectionError(format!("TCP connect to {} failed: {}", self.proxy_host, e))
        })?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Open a TLS connection to the proxy with the given config
    pub async fn dial_tls(
        &self,
        config: Arc<rustls::ClientConfig>,
    ) -> TunnelResult<TlsStream<TcpStream>> {
        let tcp = self.dial_tcp().await?;
        let server_name = self.server_name()?;

        TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| TunnelError::TlsError(format!("TLS handshake failed: {}", e)))
    }
}
