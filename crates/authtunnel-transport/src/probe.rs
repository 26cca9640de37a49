//! Minimal HTTP GET client for probing the proxy
//!
//! Used by the protocol picker (which inspects `Alt-Svc` and the negotiated
//! version) and by the login flow (which reads the login URL from the body).

use crate::{with_alpn, ProxyTarget, TunnelError, TunnelResult};
use bytes::Bytes;
use http::{header, HeaderMap, Request, StatusCode, Version};
use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Response of a probe request
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProbeResponse {
    /// Whether any `Alt-Svc` header advertises HTTP/3
    pub fn advertises_h3(&self) -> bool {
        self.headers
            .get_all(header::ALT_SVC)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("h3"))
    }

    /// Whether the response came over HTTP/2
    pub fn is_http2(&self) -> bool {
        self.version == Version::HTTP_2
    }
}

/// GET `path_and_query` from the proxy.
///
/// With TLS, both `h2` and `http/1.1` are offered and the protocol the proxy
/// selects is used, so the response version reflects what it supports.
pub async fn http_get(
    target: &ProxyTarget,
    path_and_query: &str,
    timeout: Duration,
) -> TunnelResult<ProbeResponse> {
    tokio::time::timeout(timeout, get(target, path_and_query))
        .await
        .map_err(|_| {
            TunnelError::ConnectionError(format!("GET {} timed out", target.server_url()))
        })?
}

async fn get(target: &ProxyTarget, path_and_query: &str) -> TunnelResult<ProbeResponse> {
    match &target.tls {
        Some(config) => {
            let config = with_alpn(config, &[b"h2", b"http/1.1"]);
            let stream = target.dial_tls(config).await?;
            let is_h2 = stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            debug!(
                "Probe connection to {} negotiated {}",
                target.proxy_host,
                if is_h2 { "h2" } else { "http/1.1" }
            );

            if is_h2 {
                let uri = format!("https://{}{}", target.authority(), path_and_query);
                send_http2(stream, build_request(&uri, None)?).await
            } else {
                send_http1(stream, build_request(path_and_query, Some(target.authority()))?).await
            }
        }
        None => {
            let stream = target.dial_tcp().await?;
            send_http1(stream, build_request(path_and_query, Some(target.authority()))?).await
        }
    }
}

fn build_request(uri: &str, host: Option<&str>) -> TunnelResult<Request<Empty<Bytes>>> {
    let mut builder = Request::get(uri).header(header::USER_AGENT, "authtunnel");
    if let Some(host) = host {
        builder = builder.header(header::HOST, host);
    }
    builder
        .body(Empty::new())
        .map_err(|e| TunnelError::ProtocolError(format!("Invalid request: {}", e)))
}

async fn send_http1<S>(stream: S, request: Request<Empty<Bytes>>) -> TunnelResult<ProbeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| TunnelError::ProtocolError(format!("HTTP/1.1 handshake failed: {}", e)))?;

    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection closed: {}", e);
        }
    });

    let result = match sender.send_request(request).await {
        Ok(response) => collect(response).await,
        Err(e) => Err(TunnelError::ProtocolError(format!("HTTP/1.1 request failed: {}", e))),
    };
    driver.abort();
    result
}

async fn send_http2<S>(stream: S, request: Request<Empty<Bytes>>) -> TunnelResult<ProbeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .map_err(|e| TunnelError::ProtocolError(format!("HTTP/2 handshake failed: {}", e)))?;

    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection closed: {}", e);
        }
    });

    let result = match sender.send_request(request).await {
        Ok(response) => collect(response).await,
        Err(e) => Err(TunnelError::ProtocolError(format!("HTTP/2 request failed: {}", e))),
    };
    driver.abort();
    result
}

async fn collect(response: http::Response<Incoming>) -> TunnelResult<ProbeResponse> {
    let (parts, body) = response.into_parts();
    let body = Limited::new(body, MAX_BODY_SIZE)
        .collect()
        .await
        .map_err(|e| TunnelError::ProtocolError(format!("Failed to read body: {}", e)))?
        .to_bytes();

    Ok(ProbeResponse {
        version: parts.version,
        status: parts.status,
        headers: parts.headers,
        body,
    })
}
