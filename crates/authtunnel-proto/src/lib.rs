//! Wire-level definitions for the authenticated tunnel client.
//!
//! This crate holds everything that is pure data: the QUIC variable-length
//! integer encoding, the HTTP Capsule framing used to carry UDP payloads over
//! a byte stream, the HTTP Datagram framing used on QUIC, and the resolver
//! that turns a destination and an optional proxy URL into dialable targets.

pub mod capsule;
pub mod urls;
pub mod varint;

pub use capsule::{
    decode_context_payload, decode_quic_datagram, encode_context_payload, encode_quic_datagram,
    Capsule, CapsuleCodec, CodecError, DATAGRAM_CAPSULE_TYPE, DEFAULT_CONTEXT_ID,
};
pub use urls::{parse_urls, ProxyUrl, UrlError};

/// Authorization scheme sent in front of the bearer token
pub const AUTHORIZATION_SCHEME: &str = "Pomerium";

/// Header announcing that the request body carries HTTP capsules
pub const CAPSULE_PROTOCOL_HEADER: &str = "capsule-protocol";

/// Structured-field boolean `true`
pub const CAPSULE_PROTOCOL_ENABLED: &str = "?1";

/// Upgrade token for UDP proxying over HTTP/1.1
pub const CONNECT_UDP_PROTOCOL: &str = "connect-udp";

/// Largest UDP payload the tunnel will carry
pub const MAX_UDP_PACKET_SIZE: usize = 65535;

/// Build the `Authorization` header value for a token.
///
/// Returns `None` for an empty token so callers can omit the header.
pub fn authorization_value(token: &str) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(format!("{} {}", AUTHORIZATION_SCHEME, token))
    }
}

/// Path of the well-known MASQUE UDP proxying endpoint for a destination.
pub fn masque_udp_path(host: &str, port: &str) -> String {
    format!("/.well-known/masque/udp/{}/{}/", host, port)
}

/// Split a `host:port` authority, stripping IPv6 brackets from the host.
pub fn split_host_port(addr: &str) -> Option<(&str, &str)> {
    let (host, port) = addr.rsplit_once(':')?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']')?,
        None => host,
    };
    if host.is_empty() || port.is_empty() {
        return None;
    }
    Some((host, port))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: impl std::fmt::Display) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
