use crate::connection::{h3_error, Http3Connection, RequestStream, FIRST_QUARTER_STREAM_ID};
use crate::Http3Tunneler;
use async_trait::async_trait;
use authtunnel_proto::{
    authorization_value, decode_quic_datagram, encode_quic_datagram, masque_udp_path,
    CAPSULE_PROTOCOL_ENABLED, CAPSULE_PROTOCOL_HEADER, DEFAULT_CONTEXT_ID,
};
use authtunnel_transport::{
    classify_status, relay, with_cancel, EventSink, PacketConn, TunnelError, TunnelResult,
    UdpTunneler,
};
use http::{header, Method, Request};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

impl Http3Tunneler {
    pub(crate) fn connect_udp_request(&self, token: &str) -> TunnelResult<Request<()>> {
        let (host, port) = self.target.destination_parts()?;
        let uri = format!(
            "https://{}{}",
            self.target.proxy_host,
            masque_udp_path(host, port)
        );

        let mut request = Request::builder()
            .method(Method::CONNECT)
            .uri(uri)
            .header(CAPSULE_PROTOCOL_HEADER, CAPSULE_PROTOCOL_ENABLED);
        if let Some(auth) = authorization_value(token) {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let mut request = request.body(()).map_err(|e| {
            TunnelError::ProtocolError(format!("Invalid CONNECT-UDP request: {}", e))
        })?;
        request
            .extensions_mut()
            .insert(h3::ext::Protocol::CONNECT_UDP);
        Ok(request)
    }
}

#[async_trait]
impl UdpTunneler for Http3Tunneler {
    fn name(&self) -> &'static str {
        "http3"
    }

    async fn tunnel_udp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &dyn PacketConn,
        token: &str,
    ) -> TunnelResult<()> {
        let Some(tls) = &self.target.tls else {
            return Err(TunnelError::Unsupported("http3 requires TLS".to_string()));
        };
        let request = self.connect_udp_request(token)?;

        events.on_connecting();

        let (connection, response, mut stream) = with_cancel(cancel, async {
            let mut connection = Http3Connection::dial(&self.target, tls).await?;
            connection.require_connect_udp().await?;
            let mut stream = connection
                .send_request
                .send_request(request)
                .await
                .map_err(|e| h3_error("H3 CONNECT-UDP failed", e))?;
            let response = stream
                .recv_response()
                .await
                .map_err(|e| h3_error("H3 CONNECT-UDP failed", e))?;
            Ok((connection, response, stream))
        })
        .await?;

        classify_status(response.status().as_u16(), true)?;

        info!(
            proxy = %self.target.proxy_host,
            destination = %self.target.destination,
            "udp connection established"
        );
        events.on_connected();

        let quic = &connection.quic;
        let result = relay(
            cancel,
            async {
                let mut warned_too_large = false;
                while let Some(packet) = local.read_packet().await? {
                    let datagram = encode_quic_datagram(FIRST_QUARTER_STREAM_ID, &packet.payload)?;
                    match quic.send_datagram(datagram) {
                        Ok(()) => {}
                        Err(quinn::SendDatagramError::TooLarge) => {
                            if !warned_too_large {
                                warn!(
                                    "Dropping UDP packet of {} bytes: exceeds QUIC datagram size {:?}",
                                    packet.payload.len(),
                                    quic.max_datagram_size()
                                );
                                warned_too_large = true;
                            }
                        }
                        Err(e) => return Err(h3_error("QUIC datagram send failed", e)),
                    }
                }
                debug!("Local packet source closed");
                Ok::<_, TunnelError>(())
            },
            async {
                tokio::select! {
                    result = forward_datagrams(quic, local) => result,
                    result = drain_stream(&mut stream) => result,
                }
            },
        )
        .await;

        events.on_disconnected(result.as_ref().err().filter(|e| !e.is_cancelled()));
        result
    }
}

/// Deliver proxy datagrams addressed to this tunnel's stream and context
async fn forward_datagrams(quic: &quinn::Connection, local: &dyn PacketConn) -> TunnelResult<()> {
    loop {
        let datagram = quic
            .read_datagram()
            .await
            .map_err(|e| h3_error("QUIC datagram receive failed", e))?;
        let (quarter_stream_id, context_id, payload) = decode_quic_datagram(datagram)?;
        if quarter_stream_id != FIRST_QUARTER_STREAM_ID {
            trace!("Skipping datagram for stream {}", quarter_stream_id);
            continue;
        }
        if context_id != DEFAULT_CONTEXT_ID {
            trace!("Skipping datagram for context {}", context_id);
            continue;
        }
        local.write_packet(payload).await?;
    }
}

/// Read and discard the CONNECT-UDP stream.
///
/// The proxy finishing its side of the stream does not end the session;
/// datagrams keep flowing until the connection closes.
async fn drain_stream(stream: &mut RequestStream) -> TunnelResult<()> {
    while stream
        .recv_data()
        .await
        .map_err(|e| h3_error("H3 receive error", e))?
        .is_some()
    {}
    debug!("Proxy finished the CONNECT-UDP stream");
    std::future::pending().await
}
