//! Destination and proxy URL resolution

use crate::{join_host_port, split_host_port};
use std::fmt;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("invalid destination")]
    InvalidDestination,

    #[error("invalid pomerium url")]
    InvalidProxyUrl,
}

/// Where the tunnel client dials: a scheme and a `host:port` authority
/// that always carries an explicit port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyUrl {
    pub scheme: String,
    pub host: String,
}

impl ProxyUrl {
    fn new(scheme: &str, hostname: &str, port: Option<u16>) -> Self {
        let port = port.unwrap_or(if scheme == "https" { 443 } else { 80 });
        Self {
            scheme: scheme.to_string(),
            host: join_host_port(hostname, port),
        }
    }

    /// TLS is used only for `https` proxies
    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }

    /// Host name without the port or IPv6 brackets
    pub fn hostname(&self) -> &str {
        split_host_port(&self.host)
            .map(|(host, _)| host)
            .unwrap_or(&self.host)
    }
}

impl fmt::Display for ProxyUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.host)
    }
}

/// Resolve a destination and an optional proxy override.
///
/// Accepted destination forms:
/// - `host:port`, tunneled through `https://host:443`
/// - `[tcp+|udp+]scheme://host[:port]`, tunneled through `scheme://host`;
///   the destination is the authority exactly as written
/// - `[tcp+|udp+]scheme://proxy[:port]/host:port`
///
/// A non-empty `proxy` replaces whatever proxy the destination implied. A
/// missing proxy port defaults to 443 for `https` and 80 otherwise.
pub fn parse_urls(destination: &str, proxy: &str) -> Result<(String, ProxyUrl), UrlError> {
    let (destination_addr, mut proxy_url) = if destination.contains("://") {
        parse_destination_url(destination)?
    } else {
        let (host, port) = split_host_port(destination).ok_or(UrlError::InvalidDestination)?;
        (
            join_host_port(host, port),
            ProxyUrl::new("https", host, None),
        )
    };

    if !proxy.is_empty() {
        let url = Url::parse(proxy).map_err(|_| UrlError::InvalidProxyUrl)?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(UrlError::InvalidProxyUrl)?;
        proxy_url = ProxyUrl::new(url.scheme(), trim_brackets(host), url.port());
    }

    Ok((destination_addr, proxy_url))
}

fn parse_destination_url(destination: &str) -> Result<(String, ProxyUrl), UrlError> {
    let destination = destination
        .strip_prefix("tcp+")
        .or_else(|| destination.strip_prefix("udp+"))
        .unwrap_or(destination);

    let url = Url::parse(destination).map_err(|_| UrlError::InvalidDestination)?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .map(trim_brackets)
        .ok_or(UrlError::InvalidDestination)?;

    let first_segment = url
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty());

    match first_segment {
        Some(target) => Ok((
            target.to_string(),
            ProxyUrl::new(url.scheme(), host, url.port()),
        )),
        None => Ok((
            raw_authority(destination).to_string(),
            ProxyUrl::new(url.scheme(), host, None),
        )),
    }
}

/// The authority of `url` as written, without user info
fn raw_authority(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host)
}

fn trim_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(destination: &str, proxy: &str) -> Result<(String, String), UrlError> {
        parse_urls(destination, proxy).map(|(addr, url)| (addr, url.to_string()))
    }

    #[test]
    fn test_host_port_destination() {
        assert_eq!(
            resolve("redis.example.com:6379", ""),
            Ok((
                "redis.example.com:6379".to_string(),
                "https://redis.example.com:443".to_string()
            ))
        );
    }

    #[test]
    fn test_scheme_prefixed_destination() {
        assert_eq!(
            resolve("tcp+https://redis.example.com:6379", ""),
            Ok((
                "redis.example.com:6379".to_string(),
                "https://redis.example.com:443".to_string()
            ))
        );
        assert_eq!(
            resolve("udp+https://dns.example.com:53", ""),
            Ok((
                "dns.example.com:53".to_string(),
                "https://dns.example.com:443".to_string()
            ))
        );
    }

    #[test]
    fn test_http_destination() {
        assert_eq!(
            resolve("http://redis.example.com:6379", ""),
            Ok((
                "redis.example.com:6379".to_string(),
                "http://redis.example.com:80".to_string()
            ))
        );
    }

    #[test]
    fn test_destination_keeps_written_authority() {
        assert_eq!(
            resolve("https://redis.example.com", ""),
            Ok((
                "redis.example.com".to_string(),
                "https://redis.example.com:443".to_string()
            ))
        );
        assert_eq!(
            resolve("tcp+https://redis.example.com:443", ""),
            Ok((
                "redis.example.com:443".to_string(),
                "https://redis.example.com:443".to_string()
            ))
        );
        assert_eq!(
            resolve("udp+http://user@[::1]:53/", ""),
            Ok(("[::1]:53".to_string(), "http://[::1]:80".to_string()))
        );
    }

    #[test]
    fn test_path_embedded_destination() {
        assert_eq!(
            resolve("https://proxy.example.com/redis.example.com:6379", ""),
            Ok((
                "redis.example.com:6379".to_string(),
                "https://proxy.example.com:443".to_string()
            ))
        );
        assert_eq!(
            resolve("https://proxy.example.com:8443/redis.example.com:6379", ""),
            Ok((
                "redis.example.com:6379".to_string(),
                "https://proxy.example.com:8443".to_string()
            ))
        );
    }

    #[test]
    fn test_proxy_override() {
        let (addr, proxy) = parse_urls("redis.example.com:6379", "https://proxy.example.com").unwrap();
        assert_eq!(addr, "redis.example.com:6379");
        assert_eq!(proxy.host, "proxy.example.com:443");
        assert!(proxy.is_tls());
        assert_eq!(proxy.hostname(), "proxy.example.com");

        let (_, proxy) = parse_urls("redis.example.com:6379", "http://127.0.0.1:8080").unwrap();
        assert_eq!(proxy.to_string(), "http://127.0.0.1:8080");
        assert!(!proxy.is_tls());
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(resolve("", ""), Err(UrlError::InvalidDestination));
        assert_eq!(resolve("redis.example.com", ""), Err(UrlError::InvalidDestination));
        assert_eq!(
            resolve("redis.example.com:6379", "example.com:1234"),
            Err(UrlError::InvalidProxyUrl)
        );
        assert_eq!(
            resolve("redis.example.com:6379", "not a url"),
            Err(UrlError::InvalidProxyUrl)
        );
    }

    #[test]
    fn test_ipv6_destination() {
        let (addr, proxy) = parse_urls("[::1]:6379", "").unwrap();
        assert_eq!(addr, "[::1]:6379");
        assert_eq!(proxy.host, "[::1]:443");
        assert_eq!(proxy.hostname(), "::1");
    }
}
