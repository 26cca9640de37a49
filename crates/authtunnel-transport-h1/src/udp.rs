use crate::handshake::{request_head, round_trip};
use crate::Http1Tunneler;
use async_trait::async_trait;
use authtunnel_proto::{
    decode_context_payload, masque_udp_path, Capsule, CapsuleCodec, CAPSULE_PROTOCOL_ENABLED,
    CONNECT_UDP_PROTOCOL, DEFAULT_CONTEXT_ID,
};
use authtunnel_transport::{
    classify_status, relay, with_cancel, EventSink, PacketConn, TunnelError, TunnelResult,
    UdpTunneler,
};
use futures::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

const SWITCHING_PROTOCOLS: u16 = 101;

#[async_trait]
impl UdpTunneler for Http1Tunneler {
    fn name(&self) -> &'static str {
        "http1"
    }

    async fn tunnel_udp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &dyn PacketConn,
        token: &str,
    ) -> TunnelResult<()> {
        events.on_connecting();

        let destination = self.target.destination.as_str();
        let (host, port) = self.target.destination_parts()?;
        let path = masque_udp_path(host, port);
        let head = request_head(
            "GET",
            &path,
            &[
                ("Host", destination),
                ("Connection", "Upgrade"),
                ("Upgrade", CONNECT_UDP_PROTOCOL),
                ("Capsule-Protocol", CAPSULE_PROTOCOL_ENABLED),
            ],
            token,
        );

        let (status, remote) = with_cancel(cancel, async {
            let stream = self.dial().await?;
            round_trip(stream, &head).await
        })
        .await?;
        if status != SWITCHING_PROTOCOLS {
            classify_status(status, false)?;
        }

        info!(
            proxy = %self.target.proxy_host,
            destination,
            "udp connection established"
        );
        events.on_connected();

        let (remote_read, remote_write) = tokio::io::split(remote);
        let mut capsules_in = FramedRead::new(remote_read, CapsuleCodec::new());
        let mut capsules_out = FramedWrite::new(remote_write, CapsuleCodec::new());

        let result = relay(
            cancel,
            async {
                while let Some(packet) = local.read_packet().await? {
                    capsules_out.send(Capsule::datagram(&packet.payload)).await?;
                }
                debug!("Local packet source closed");
                Ok::<_, TunnelError>(())
            },
            async {
                while let Some(capsule) = capsules_in.next().await {
                    let capsule = capsule?;
                    if !capsule.is_datagram() {
                        trace!("Skipping capsule of type {}", capsule.capsule_type);
                        continue;
                    }
                    let (context_id, payload) = decode_context_payload(capsule.value)?;
                    if context_id != DEFAULT_CONTEXT_ID {
                        trace!("Skipping datagram for context {}", context_id);
                        continue;
                    }
                    local.write_packet(payload).await?;
                }
                debug!("Proxy closed the capsule stream");
                Ok::<_, TunnelError>(())
            },
        )
        .await;

        events.on_disconnected(result.as_ref().err().filter(|e| !e.is_cancelled()));
        result
    }
}
