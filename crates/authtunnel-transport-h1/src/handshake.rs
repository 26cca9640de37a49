//! HTTP/1.1 request writing and response head parsing

use authtunnel_proto::authorization_value;
use authtunnel_transport::{TunnelError, TunnelResult};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::trace;

/// Upper bound on a proxy response head
const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// Serialize a request head with an optional bearer token
pub(crate) fn request_head(
    method: &str,
    target: &str,
    headers: &[(&str, &str)],
    token: &str,
) -> String {
    let mut head = format!("{} {} HTTP/1.1\r\n", method, target);
    for (name, value) in headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if let Some(auth) = authorization_value(token) {
        head.push_str(&format!("Authorization: {}\r\n", auth));
    }
    head.push_str("User-Agent: authtunnel\r\n\r\n");
    head
}

/// Write `head` and read the proxy's response head.
///
/// Returns the status code and the stream wrapped so that bytes read past the
/// head are replayed before anything else.
pub(crate) async fn round_trip<S>(mut stream: S, head: &str) -> TunnelResult<(u16, Rewind<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(TunnelError::ConnectionError(
                "proxy closed the connection before responding".to_string(),
            ));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response
            .parse(&buf)
            .map_err(|e| TunnelError::ProtocolError(format!("Invalid HTTP response: {}", e)))?
        {
            httparse::Status::Complete(len) => {
                let status = response.code.unwrap_or(0);
                trace!("Proxy responded {} ({} byte head)", status, len);
                buf.advance(len);
                return Ok((status, Rewind::new(buf.freeze(), stream)));
            }
            httparse::Status::Partial if buf.len() >= MAX_HEAD_SIZE => {
                return Err(TunnelError::ProtocolError(
                    "HTTP response head too large".to_string(),
                ));
            }
            httparse::Status::Partial => {}
        }
    }
}

/// Stream that yields a buffered prefix before reading from `inner`
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet handed out
    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let len = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(len);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
