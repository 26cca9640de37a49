//! Tunnel orchestrator: token lifecycle, protocol selection and listeners

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::TunnelConfig;
use crate::picker::{pick_tcp_tunneler, pick_udp_tunneler};
use crate::udp_session::{SessionHandler, UdpSession, UdpSessionManager};
use async_trait::async_trait;
use authtunnel_auth::{default_cache, AuthError, Authenticator, JwtCache, OnOpenBrowser};
use authtunnel_transport::{
    with_cancel, EventSink, LocalStream, LogEvents, PacketConn, ProxyTarget, TcpTunneler,
    TunnelError, TunnelResult, UdpTunneler,
};
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One attempt of a tunnel with a given bearer token
#[async_trait]
pub trait AttemptHandler: Send {
    async fn attempt(&mut self, token: &str) -> TunnelResult<()>;
}

/// Tunnels local connections to one destination through one proxy
pub struct Tunnel {
    config: TunnelConfig,
    target: ProxyTarget,
    cache: Arc<dyn JwtCache>,
    authenticator: Arc<dyn Authenticator>,
    tcp_tunneler: OnceCell<Arc<dyn TcpTunneler>>,
    udp_tunneler: OnceCell<Arc<dyn UdpTunneler>>,
}

impl Tunnel {
    /// Create a tunnel using the default JWT cache and a login client built
    /// from `config`
    pub fn new(config: TunnelConfig) -> TunnelResult<Self> {
        let target = config.proxy_target()?;
        let authenticator = Arc::new(config.auth_client(target.tls.clone()));
        Ok(Self {
            config,
            target,
            cache: default_cache(),
            authenticator,
            tcp_tunneler: OnceCell::new(),
            udp_tunneler: OnceCell::new(),
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn JwtCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Skip probing and always use `tunneler` for TCP
    pub fn with_tcp_tunneler(mut self, tunneler: Arc<dyn TcpTunneler>) -> Self {
        self.tcp_tunneler = OnceCell::new_with(Some(tunneler));
        self
    }

    /// Skip probing and always use `tunneler` for UDP
    pub fn with_udp_tunneler(mut self, tunneler: Arc<dyn UdpTunneler>) -> Self {
        self.udp_tunneler = OnceCell::new_with(Some(tunneler));
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Key of this tunnel's token in the JWT cache
    pub fn cache_key(&self) -> String {
        self.target.cache_key()
    }

    /// Run `handler` with the cached token, logging in and retrying once
    /// when the proxy asks for authentication.
    ///
    /// The cached token is kept on success, `Unavailable`, `Unauthorized` and
    /// `Cancelled`; any other failure deletes it.
    pub async fn run_with_jwt(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        handler: &mut dyn AttemptHandler,
    ) -> TunnelResult<()> {
        let key = self.cache_key();

        let mut token = match self.cache.load_jwt(&key) {
            Ok(token) => token,
            Err(e) if e.is_miss() => {
                debug!(error = %e, "no usable cached jwt");
                String::new()
            }
            Err(e) => {
                return Err(TunnelError::AuthenticationFailed(format!(
                    "failed to load JWT: {}",
                    e
                )))
            }
        };

        let mut logged_in = false;
        loop {
            let err = match handler.attempt(&token).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if err.preserves_token() {
                return Err(err);
            }

            if err.is_unauthenticated() && !logged_in {
                logged_in = true;
                token = self.login(cancel, events, &key).await?;
                continue;
            }

            if let Err(e) = self.cache.delete_jwt(&key) {
                warn!(error = %e, "failed to delete cached jwt");
            }
            return Err(err);
        }
    }

    async fn login(
        &self,
        cancel: &CancellationToken,
        events: &dyn EventSink,
        key: &str,
    ) -> TunnelResult<String> {
        let on_open_browser: &OnOpenBrowser<'_> = &|url| events.on_auth_required(url);
        let token = self
            .authenticator
            .get_jwt(cancel, &self.target.server_url(), on_open_browser)
            .await
            .map_err(|e| match e {
                AuthError::Cancelled => TunnelError::Cancelled,
                e => TunnelError::AuthenticationFailed(format!(
                    "failed to get authentication JWT: {}",
                    e
                )),
            })?;

        self.cache.store_jwt(key, &token).map_err(|e| {
            TunnelError::AuthenticationFailed(format!("failed to store JWT: {}", e))
        })?;
        Ok(token)
    }

    async fn tcp_tunneler(&self, cancel: &CancellationToken) -> TunnelResult<Arc<dyn TcpTunneler>> {
        with_cancel(cancel, async {
            let tunneler = self
                .tcp_tunneler
                .get_or_init(|| pick_tcp_tunneler(&self.target, self.config.probe_timeout))
                .await;
            Ok(tunneler.clone())
        })
        .await
    }

    async fn udp_tunneler(&self, cancel: &CancellationToken) -> TunnelResult<Arc<dyn UdpTunneler>> {
        with_cancel(cancel, async {
            let tunneler = self
                .udp_tunneler
                .get_or_init(|| pick_udp_tunneler(&self.target, self.config.probe_timeout))
                .await;
            Ok(tunneler.clone())
        })
        .await
    }

    /// Tunnel one local byte stream until either side closes
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        local: &mut dyn LocalStream,
        events: &dyn EventSink,
    ) -> TunnelResult<()> {
        let tunneler = self.tcp_tunneler(cancel).await?;
        let mut attempt = TcpAttempt {
            tunneler: tunneler.as_ref(),
            cancel,
            events,
            local,
        };
        self.run_with_jwt(cancel, events, &mut attempt).await
    }

    /// Tunnel packets of one local UDP peer until the session lifetime runs
    /// out or either side closes
    pub async fn run_udp(
        &self,
        cancel: &CancellationToken,
        local: &dyn PacketConn,
        events: &dyn EventSink,
    ) -> TunnelResult<()> {
        let tunneler = self.udp_tunneler(cancel).await?;
        let mut attempt = UdpAttempt {
            tunneler: tunneler.as_ref(),
            cancel,
            events,
            local,
            lifetime: self.config.udp_session_lifetime,
        };
        self.run_with_jwt(cancel, events, &mut attempt).await
    }

    /// Bind `addr` and tunnel every accepted connection until cancelled
    pub async fn run_listener(
        self: Arc<Self>,
        cancel: &CancellationToken,
        addr: &str,
    ) -> TunnelResult<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            TunnelError::ConfigurationError(format!("failed to listen on {}: {}", addr, e))
        })?;
        info!(
            addr = %listener.local_addr()?,
            destination = %self.config.destination,
            "started tcp listener"
        );
        self.serve_listener(cancel, listener).await
    }

    /// Accept loop over an already bound listener
    ///
    /// Accept errors are retried with exponential backoff without limit.
    /// Returns `Ok(())` once `cancel` fires; connections still running are
    /// cancelled with it.
    pub async fn serve_listener(
        self: Arc<Self>,
        cancel: &CancellationToken,
        listener: TcpListener,
    ) -> TunnelResult<()> {
        let mut backoff = Backoff::new(BackoffConfig::default());

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("stopped tcp listener");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            let (mut stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in = ?backoff.current_backoff(),
                        "failed to accept local connection"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = backoff.wait() => {}
                    }
                    continue;
                }
            };
            backoff.reset();
            debug!(%peer, "accepted local connection");

            let tunnel = self.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let events = LogEvents::new(tunnel.config.destination.clone());
                match tunnel.run(&cancel, &mut stream, &events).await {
                    Err(e) if !e.is_cancelled() => {
                        error!(%peer, error = %e, "failed to run tunnel")
                    }
                    _ => debug!(%peer, "closed local connection"),
                }
            });
        }
    }

    /// Bind a UDP socket on `addr` and run the session manager on it
    pub async fn run_udp_listener(
        self: Arc<Self>,
        cancel: &CancellationToken,
        addr: &str,
    ) -> TunnelResult<()> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            TunnelError::ConfigurationError(format!("failed to listen on {}: {}", addr, e))
        })?;
        info!(
            addr = %socket.local_addr()?,
            destination = %self.config.destination,
            "started udp listener"
        );
        let events = Arc::new(LogEvents::new(self.config.destination.clone()));
        self.run_udp_session_manager(cancel, Arc::new(socket), events)
            .await
    }

    /// Fan `socket` out into one tunnel per peer address
    pub async fn run_udp_session_manager(
        self: Arc<Self>,
        cancel: &CancellationToken,
        socket: Arc<UdpSocket>,
        events: Arc<dyn EventSink>,
    ) -> TunnelResult<()> {
        let capacity = self.config.udp_queue_capacity;
        let handler = Arc::new(TunnelSessions {
            tunnel: self,
            events,
        });
        UdpSessionManager::new(socket, handler, capacity)
            .run(cancel)
            .await
    }
}

struct TcpAttempt<'a> {
    tunneler: &'a dyn TcpTunneler,
    cancel: &'a CancellationToken,
    events: &'a dyn EventSink,
    local: &'a mut dyn LocalStream,
}

#[async_trait]
impl AttemptHandler for TcpAttempt<'_> {
    async fn attempt(&mut self, token: &str) -> TunnelResult<()> {
        self.tunneler
            .tunnel_tcp(self.cancel, self.events, &mut *self.local, token)
            .await
    }
}

struct UdpAttempt<'a> {
    tunneler: &'a dyn UdpTunneler,
    cancel: &'a CancellationToken,
    events: &'a dyn EventSink,
    local: &'a dyn PacketConn,
    lifetime: std::time::Duration,
}

#[async_trait]
impl AttemptHandler for UdpAttempt<'_> {
    async fn attempt(&mut self, token: &str) -> TunnelResult<()> {
        let tunnel = self
            .tunneler
            .tunnel_udp(self.cancel, self.events, self.local, token);
        match tokio::time::timeout(self.lifetime, tunnel).await {
            Ok(result) => result,
            Err(_) => {
                debug!("udp session lifetime reached");
                Ok(())
            }
        }
    }
}

struct TunnelSessions {
    tunnel: Arc<Tunnel>,
    events: Arc<dyn EventSink>,
}

#[async_trait]
impl SessionHandler for TunnelSessions {
    async fn handle_session(
        &self,
        cancel: &CancellationToken,
        session: &UdpSession,
    ) -> TunnelResult<()> {
        self.tunnel
            .run_udp(cancel, session, self.events.as_ref())
            .await
    }
}
