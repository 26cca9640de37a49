//! Tunneler that walks a priority list, skipping unsupported protocols

use async_trait::async_trait;
use authtunnel_transport::{
    EventSink, LocalStream, PacketConn, TcpTunneler, TunnelError, TunnelResult, UdpTunneler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Priority list of tunnelers with a cursor at the first one still worth
/// trying.
///
/// An entry that reports `unsupported` is skipped for good; the cursor only
/// moves forward, so concurrent callers never retry a pruned entry.
pub struct Fallback<T: ?Sized> {
    tunnelers: Vec<Arc<T>>,
    cursor: AtomicUsize,
}

pub type FallbackTcpTunneler = Fallback<dyn TcpTunneler>;
pub type FallbackUdpTunneler = Fallback<dyn UdpTunneler>;

impl<T: ?Sized> Fallback<T> {
    pub fn new(tunnelers: Vec<Arc<T>>) -> Self {
        Self {
            tunnelers,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Index and tunneler at or after `from`, honoring earlier pruning
    fn candidate(&self, from: usize) -> Option<(usize, &Arc<T>)> {
        let index = from.max(self.cursor.load(Ordering::Acquire));
        self.tunnelers.get(index).map(|t| (index, t))
    }

    fn prune(&self, index: usize) {
        self.cursor.fetch_max(index + 1, Ordering::AcqRel);
    }

    /// Number of entries not yet pruned
    pub fn remaining(&self) -> usize {
        self.tunnelers
            .len()
            .saturating_sub(self.cursor.load(Ordering::Acquire))
    }
}

fn exhausted() -> TunnelError {
    TunnelError::Unsupported("no tunnelers defined".to_string())
}

#[async_trait]
impl TcpTunneler for Fallback<dyn TcpTunneler> {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn tunnel_tcp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &mut dyn LocalStream,
        token: &str,
    ) -> TunnelResult<()> {
        let mut next = 0;
        while let Some((index, tunneler)) = self.candidate(next) {
            match tunneler.tunnel_tcp(cancel, events, local, token).await {
                Err(e) if e.is_unsupported() => {
                    error!(error = %e, "{} tunneler failed", tunneler.name());
                    self.prune(index);
                    next = index + 1;
                }
                result => return result,
            }
        }
        Err(exhausted())
    }
}

#[async_trait]
impl UdpTunneler for Fallback<dyn UdpTunneler> {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn tunnel_udp(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        local: &dyn PacketConn,
        token: &str,
    ) -> TunnelResult<()> {
        let mut next = 0;
        while let Some((index, tunneler)) = self.candidate(next) {
            match tunneler.tunnel_udp(cancel, events, local, token).await {
                Err(e) if e.is_unsupported() => {
                    error!(error = %e, "{} tunneler failed", tunneler.name());
                    self.prune(index);
                    next = index + 1;
                }
                result => return result,
            }
        }
        Err(exhausted())
    }
}
