use crate::stream::{h2_error, recv_into, send_from};
use async_trait::async_trait;
use authtunnel_proto::authorization_value;
use authtunnel_transport::{
    classify_status, relay, with_alpn, with_cancel, EventSink, LocalStream, ProxyTarget,
    TcpTunneler, TunnelError, TunnelResult,
};
use http::{header, Method, Request};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// HTTP/2 CONNECT tunneler
#[derive(Debug, Clone)]
pub struct Http2Tunneler {
    target: ProxyTarget,
}

impl Http2Tunneler {
    pub fn new(target: ProxyTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    fn connect_request(&self, token: &str) -> TunnelResult<Request<()>> {
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

/// Aborts the connection driver when the tunnel ends
struct ConnectionDriver(JoinHandle<()>);

impl Drop for ConnectionDriver {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl TcpTunneler for Http2Tunneler {
    fn name(&self) -> &'static str {
        "http2"
    }

    async fn tunnel_tcp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &mut dyn LocalStream,
        token: &str,
    ) -> TunnelResult<()> {
        let Some(tls) = &self.target.tls else {
            return Err(TunnelError::Unsupported("http2 requires TLS".to_string()));
        };
        let request = self.connect_request(token)?;

        events.on_connecting();

        let (_driver, _send_request, response, mut send) = with_cancel(cancel, async {
            let stream = self.target.dial_tls(with_alpn(tls, &[b"h2"])).await?;
            if stream.get_ref().1.alpn_protocol() != Some(b"h2".as_slice()) {
                return Err(TunnelError::Unsupported(
                    "proxy did not negotiate h2".to_string(),
                ));
            }

            let (send_request, connection) = h2::client::handshake(stream)
                .await
                .map_err(|e| h2_error("H2 handshake failed", e))?;

            // Spawn connection driver
            let driver = ConnectionDriver(tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!("H2 connection closed: {}", e);
                }
            }));

            let mut send_request = send_request
                .ready()
                .await
                .map_err(|e| h2_error("H2 connection not ready", e))?;
            let (response, send) = send_request
                .send_request(request, false)
                .map_err(|e| h2_error("H2 CONNECT failed", e))?;
            let response = response
                .await
                .map_err(|e| h2_error("H2 CONNECT failed", e))?;

            Ok((driver, send_request, response, send))
        })
        .await?;

        classify_status(response.status().as_u16(), true)?;

        info!(
            proxy = %self.target.proxy_host,
            destination = %self.target.destination,
            "connection established"
        );
        events.on_connected();

        let mut recv = response.into_body();
        let (mut local_read, mut local_write) = tokio::io::split(local);

        let result = relay(
            cancel,
            send_from(&mut local_read, &mut send),
            recv_into(&mut recv, &mut local_write),
        )
        .await;

        if result.is_err() {
            send.send_reset(h2::Reason::CANCEL);
        }
        events.on_disconnected(result.as_ref().err().filter(|e| !e.is_cancelled()));
        result
    }
}
