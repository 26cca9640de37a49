//! Tunnel lifecycle observers

use crate::TunnelError;
use tracing::{error, info};

/// Observer of tunnel lifecycle events.
///
/// Sinks are side-effect only (logging, UI status) and never alter control
/// flow. All methods default to doing nothing.
pub trait EventSink: Send + Sync {
    /// About to dial the proxy
    fn on_connecting(&self) {}

    /// The proxy accepted the tunnel
    fn on_connected(&self) {}

    /// The user must log in at `auth_url`
    fn on_auth_required(&self, _auth_url: &str) {}

    /// The data plane stopped; `None` on clean close or cancellation
    fn on_disconnected(&self, _error: Option<&TunnelError>) {}
}

/// Sink that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardEvents;

impl EventSink for DiscardEvents {}

/// Sink that writes every event to the log
#[derive(Debug, Clone)]
pub struct LogEvents {
    destination: String,
}

impl LogEvents {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
        }
    }
}

impl EventSink for LogEvents {
    fn on_connecting(&self) {
        info!(destination = %self.destination, "connecting");
    }

    fn on_connected(&self) {
        info!(destination = %self.destination, "connected");
    }

    fn on_auth_required(&self, auth_url: &str) {
        info!(destination = %self.destination, auth_url, "auth required");
    }

    fn on_disconnected(&self, err: Option<&TunnelError>) {
        match err {
            Some(e) => error!(destination = %self.destination, error = %e, "disconnected"),
            None => info!(destination = %self.destination, "disconnected"),
        }
    }
}
