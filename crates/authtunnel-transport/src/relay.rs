//! Cancellation-aware data plane helpers

use crate::{TunnelError, TunnelResult};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Race `fut` against cancellation.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> TunnelResult<T>
where
    F: Future<Output = TunnelResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        result = fut => result,
    }
}

/// Drive both directions of a tunnel until it is over.
///
/// `upstream` moves local data to the proxy and `downstream` moves proxy data
/// to the local side. A clean end of `upstream` (the local side half-closed)
/// keeps `downstream` running; the tunnel ends when `downstream` finishes,
/// when either direction fails, or when `cancel` fires. Cancellation wins
/// over any I/O error it provoked.
pub async fn relay<U, D>(cancel: &CancellationToken, upstream: U, downstream: D) -> TunnelResult<()>
where
    U: Future<Output = TunnelResult<()>>,
    D: Future<Output = TunnelResult<()>>,
{
    tokio::pin!(upstream);
    tokio::pin!(downstream);
    let mut upstream_done = false;

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Err(TunnelError::Cancelled),
            result = &mut upstream, if !upstream_done => match result {
                Ok(()) => upstream_done = true,
                Err(e) => break Err(e),
            },
            result = &mut downstream => break result,
        }
    };

    match result {
        Err(_) if cancel.is_cancelled() => Err(TunnelError::Cancelled),
        other => other,
    }
}
