//! Byte pumps between a local stream and an HTTP/2 CONNECT stream

use authtunnel_transport::{TunnelError, TunnelResult};
use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use h2::{RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const READ_CHUNK: usize = 16 * 1024;

pub(crate) fn h2_error(context: &str, e: h2::Error) -> TunnelError {
    TunnelError::ConnectionError(format!("{}: {}", context, e))
}

/// Copy `local` into `send` until EOF, then end the stream
pub(crate) async fn send_from<R>(local: &mut R, send: &mut SendStream<Bytes>) -> TunnelResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        if local.read_buf(&mut buf).await? == 0 {
            send.send_data(Bytes::new(), true)
                .map_err(|e| h2_error("H2 finish error", e))?;
            return Ok(());
        }
        send_all(send, buf.split().freeze()).await?;
    }
}

/// Send `data`, waiting for flow-control capacity as needed
async fn send_all(send: &mut SendStream<Bytes>, mut data: Bytes) -> TunnelResult<()> {
    while !data.is_empty() {
        send.reserve_capacity(data.len());
        let capacity = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(Ok(capacity)) => capacity,
            Some(Err(e)) => return Err(h2_error("H2 capacity error", e)),
            None => {
                return Err(TunnelError::ConnectionError(
                    "H2 stream closed by proxy".to_string(),
                ))
            }
        };
        if capacity == 0 {
            continue;
        }

        let chunk = data.split_to(capacity.min(data.len()));
        trace!("Sending {} bytes on H2 stream", chunk.len());
        send.send_data(chunk, false)
            .map_err(|e| h2_error("H2 send error", e))?;
    }
    Ok(())
}

/// Copy `recv` into `local` until the proxy ends the stream
pub(crate) async fn recv_into<W>(recv: &mut RecvStream, local: &mut W) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = recv.data().await {
        let chunk = chunk.map_err(|e| h2_error("H2 receive error", e))?;
        local.write_all(&chunk).await?;
        // Release flow control capacity
        let _ = recv.flow_control().release_capacity(chunk.len());
    }
    local.shutdown().await?;
    Ok(())
}
