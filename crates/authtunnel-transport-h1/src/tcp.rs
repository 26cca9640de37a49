use crate::handshake::{request_head, round_trip};
use crate::Http1Tunneler;
use async_trait::async_trait;
use authtunnel_transport::{
    classify_status, relay, with_cancel, EventSink, LocalStream, TcpTunneler, TunnelError,
    TunnelResult,
};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[async_trait]
impl TcpTunneler for Http1Tunneler {
    fn name(&self) -> &'static str {
        "http1"
    }

    async fn tunnel_tcp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &mut dyn LocalStream,
        token: &str,
    ) -> TunnelResult<()> {
        events.on_connecting();

        let destination = self.target.destination.as_str();
        let head = request_head(
            "CONNECT",
            destination,
            &[("Host", destination)],
            token,
        );

        let (status, remote) = with_cancel(cancel, async {
            let stream = self.dial().await?;
            round_trip(stream, &head).await
        })
        .await?;
        classify_status(status, false)?;

        info!(
            proxy = %self.target.proxy_host,
            destination,
            "connection established"
        );
        events.on_connected();

        let (mut local_read, mut local_write) = tokio::io::split(local);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);

        let result = relay(
            cancel,
            async {
                let sent = tokio::io::copy(&mut local_read, &mut remote_write).await?;
                debug!("Local side closed after {} bytes", sent);
                remote_write.shutdown().await?;
                Ok::<_, TunnelError>(())
            },
            async {
                let received = tokio::io::copy(&mut remote_read, &mut local_write).await?;
                debug!("Proxy side closed after {} bytes", received);
                local_write.shutdown().await?;
                Ok::<_, TunnelError>(())
            },
        )
        .await;

        events.on_disconnected(result.as_ref().err().filter(|e| !e.is_cancelled()));
        result
    }
}
