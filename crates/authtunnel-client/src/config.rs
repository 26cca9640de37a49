//! Tunnel configuration

use authtunnel_auth::AuthClient;
use authtunnel_proto::{parse_urls, split_host_port, UrlError};
use authtunnel_transport::{ProxyTarget, TlsOptions, TunnelResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to tunnel to one destination through one proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// `host:port` the proxy connects to
    pub destination: String,

    /// `host:port` of the proxy
    pub proxy_host: String,

    /// TLS to the proxy; `None` speaks cleartext HTTP/1.1
    pub tls: Option<TlsOptions>,

    pub service_account: Option<String>,
    pub service_account_file: Option<PathBuf>,

    /// Command used to open login URLs
    pub browser_command: Option<String>,

    /// UDP sessions are disconnected after this long
    #[serde(with = "duration_secs")]
    pub udp_session_lifetime: Duration,

    /// Packets buffered per UDP session before the oldest is dropped
    pub udp_queue_capacity: usize,

    /// Timeout of the protocol probe
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            destination: String::new(),
            proxy_host: String::new(),
            tls: Some(TlsOptions::default()),
            service_account: None,
            service_account_file: None,
            browser_command: None,
            udp_session_lifetime: Duration::from_secs(10 * 60),
            udp_queue_capacity: 1,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::default()
    }

    /// Resolve a destination and optional proxy URL into a config.
    ///
    /// TLS is enabled only when the proxy URL is `https`.
    pub fn from_urls(destination: &str, proxy: &str) -> Result<Self, UrlError> {
        let (destination, proxy) = parse_urls(destination, proxy)?;
        Ok(Self {
            destination,
            tls: proxy.is_tls().then(TlsOptions::default),
            proxy_host: proxy.host,
            ..Self::default()
        })
    }

    /// Dialing target with the TLS client config compiled
    pub fn proxy_target(&self) -> TunnelResult<ProxyTarget> {
        let tls = match &self.tls {
            Some(options) => Some(options.build_client_config()?),
            None => None,
        };
        Ok(ProxyTarget::new(
            self.destination.clone(),
            self.proxy_host.clone(),
            tls,
        ))
    }

    /// Login client matching this config
    pub fn auth_client(&self, tls: Option<Arc<rustls::ClientConfig>>) -> AuthClient {
        let mut client = AuthClient::new();
        if let Some(token) = &self.service_account {
            client = client.with_service_account(token.clone());
        }
        if let Some(path) = &self.service_account_file {
            client = client.with_service_account_file(path.clone());
        }
        if let Some(command) = &self.browser_command {
            client = client.with_browser_command(command.clone());
        }
        if let Some(tls) = tls {
            client = client.with_tls(tls);
        }
        client
    }
}

/// Builder for TunnelConfig
#[derive(Default)]
pub struct TunnelConfigBuilder {
    config: TunnelConfig,
}

impl TunnelConfigBuilder {
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.config.destination = destination.into();
        self
    }

    pub fn proxy_host(mut self, proxy_host: impl Into<String>) -> Self {
        self.config.proxy_host = proxy_host.into();
        self
    }

    pub fn tls(mut self, options: TlsOptions) -> Self {
        self.config.tls = Some(options);
        self
    }

    /// Talk to the proxy in cleartext
    pub fn no_tls(mut self) -> Self {
        self.config.tls = None;
        self
    }

    pub fn service_account(mut self, token: impl Into<String>) -> Self {
        self.config.service_account = Some(token.into());
        self
    }

    pub fn service_account_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.service_account_file = Some(path.into());
        self
    }

    pub fn browser_command(mut self, command: impl Into<String>) -> Self {
        self.config.browser_command = Some(command.into());
        self
    }

    pub fn udp_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.udp_session_lifetime = lifetime;
        self
    }

    pub fn udp_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.udp_queue_capacity = capacity;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TunnelConfig, String> {
        if split_host_port(&self.config.destination).is_none() {
            return Err("destination must be host:port".to_string());
        }
        if split_host_port(&self.config.proxy_host).is_none() {
            return Err("proxy host must be host:port".to_string());
        }
        if self.config.udp_queue_capacity == 0 {
            return Err("udp queue capacity must be at least 1".to_string());
        }
        Ok(self.config)
    }
}
