//! QUIC client configuration

use authtunnel_transport::{with_alpn, TunnelError, TunnelResult};
use std::sync::Arc;
use std::time::Duration;

/// Initial path MTU; leaves room for typical tunnel overhead
pub const INITIAL_MTU: u16 = 1350;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a quinn client config speaking `h3` with datagrams enabled
pub fn quic_client_config(tls: &rustls::ClientConfig) -> TunnelResult<quinn::ClientConfig> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(with_alpn(tls, &[b"h3"]))
        .map_err(|e| TunnelError::TlsError(format!("TLS config unusable for QUIC: {}", e)))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.initial_mtu(INITIAL_MTU);
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().map_err(|_| {
        TunnelError::ConfigurationError("idle timeout out of range".to_string())
    })?));
    transport.datagram_receive_buffer_size(Some(1024 * 1024));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use authtunnel_transport::TlsOptions;

    #[test]
    fn test_builds_from_insecure_tls() {
        let tls = TlsOptions::default()
            .with_insecure_skip_verify()
            .build_client_config()
            .unwrap();
        assert!(quic_client_config(&tls).is_ok());
    }

    #[test]
    fn test_alpn_is_added_to_a_copy() {
        let tls = TlsOptions::default().build_client_config().unwrap();
        quic_client_config(&tls).unwrap();
        assert!(tls.alpn_protocols.is_empty());
    }
}
