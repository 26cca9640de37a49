use crate::connection::{h3_error, Http3Connection};
use crate::Http3Tunneler;
use async_trait::async_trait;
use authtunnel_proto::authorization_value;
use authtunnel_transport::{
    classify_status, relay, with_cancel, EventSink, LocalStream, TcpTunneler, TunnelError,
    TunnelResult,
};
use bytes::{Buf, Bytes, BytesMut};
use http::{header, Method, Request};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const READ_CHUNK: usize = 16 * 1024;

type SendHalf = h3::client::RequestStream<h3_quinn::SendStream<Bytes>, Bytes>;
type RecvHalf = h3::client::RequestStream<h3_quinn::RecvStream, Bytes>;

impl Http3Tunneler {
    pub(crate) fn connect_request(&self, token: &str) -> TunnelResult<Request<()>> {
        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(self.target.destination.as_str());
        if let Some(auth) = authorization_value(token) {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder
            .body(())
            .map_err(|e| TunnelError::ProtocolError(format!("Invalid CONNECT request: {}", e)))
    }
}

#[async_trait]
impl TcpTunneler for Http3Tunneler {
    fn name(&self) -> &'static str {
        "http3"
    }

    async fn tunnel_tcp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &mut dyn LocalStream,
        token: &str,
    ) -> TunnelResult<()> {
        let Some(tls) = &self.target.tls else {
            return Err(TunnelError::Unsupported("http3 requires TLS".to_string()));
        };
        let request = self.connect_request(token)?;

        events.on_connecting();

        let (_connection, response, stream) = with_cancel(cancel, async {
            let mut connection = Http3Connection::dial(&self.target, tls).await?;
            let mut stream = connection
                .send_request
                .send_request(request)
                .await
                .map_err(|e| h3_error("H3 CONNECT failed", e))?;
            let response = stream
                .recv_response()
                .await
                .map_err(|e| h3_error("H3 CONNECT failed", e))?;
            Ok((connection, response, stream))
        })
        .await
        .map_err(|e| match e {
            TunnelError::Cancelled => e,
            other => TunnelError::Unsupported(format!("http3 unavailable: {}", other)),
        })?;

        classify_status(response.status().as_u16(), true)?;

        info!(
            proxy = %self.target.proxy_host,
            destination = %self.target.destination,
            "connection established"
        );
        events.on_connected();

        let (mut send, mut recv) = stream.split();
        let (mut local_read, mut local_write) = tokio::io::split(local);

        let result = relay(
            cancel,
            send_from(&mut local_read, &mut send),
            recv_into(&mut recv, &mut local_write),
        )
        .await;

        events.on_disconnected(result.as_ref().err().filter(|e| !e.is_cancelled()));
        result
    }
}

/// Copy `local` into the request stream until EOF, then finish it
async fn send_from<R>(local: &mut R, send: &mut SendHalf) -> TunnelResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        if local.read_buf(&mut buf).await? == 0 {
            send.finish()
                .await
                .map_err(|e| h3_error("H3 finish error", e))?;
            return Ok(());
        }
        let chunk = buf.split().freeze();
        trace!("Sending {} bytes on H3 stream", chunk.len());
        send.send_data(chunk)
            .await
            .map_err(|e| h3_error("H3 send error", e))?;
    }
}

/// Copy the request stream into `local` until the proxy finishes it
async fn recv_into<W>(recv: &mut RecvHalf, local: &mut W) -> TunnelResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut chunk) = recv
        .recv_data()
        .await
        .map_err(|e| h3_error("H3 receive error", e))?
    {
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        local.write_all(&bytes).await?;
    }
    debug!("Proxy finished the H3 stream");
    local.shutdown().await?;
    Ok(())
}
