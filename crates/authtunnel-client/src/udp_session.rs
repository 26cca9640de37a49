//! Fan-out of one local UDP socket into per-peer tunnel sessions

use async_trait::async_trait;
use authtunnel_proto::MAX_UDP_PACKET_SIZE;
use authtunnel_transport::{PacketReader, PacketWriter, TunnelError, TunnelResult, UdpPacket};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs the tunnel for one UDP session
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Serve `session` until it ends; `cancel` fires when the manager stops
    async fn handle_session(
        &self,
        cancel: &CancellationToken,
        session: &UdpSession,
    ) -> TunnelResult<()>;
}

/// Bounded FIFO that evicts its oldest packet instead of blocking
#[derive(Debug)]
pub struct PacketQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    packets: VecDeque<UdpPacket>,
    dropped: u64,
    closed: bool,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `packet`; returns `false` when an older packet was dropped
    /// to make room, or when the queue is closed.
    pub fn push(&self, packet: UdpPacket) -> bool {
        let mut state = self.state();
        if state.closed {
            state.dropped += 1;
            return false;
        }
        let mut kept_all = true;
        if state.packets.len() >= self.capacity {
            state.packets.pop_front();
            state.dropped += 1;
            kept_all = false;
        }
        state.packets.push_back(packet);
        drop(state);
        self.notify.notify_one();
        kept_all
    }

    /// Next packet; `None` once the queue is closed and empty
    pub async fn pop(&self) -> Option<UdpPacket> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state();
                if let Some(packet) = state.packets.pop_front() {
                    return Some(packet);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Packets dropped so far
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }

    pub fn len(&self) -> usize {
        self.state().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Packets exchanged with one local peer
pub struct UdpSession {
    addr: SocketAddr,
    inbound: Arc<PacketQueue>,
    outbound: mpsc::Sender<UdpPacket>,
}

impl UdpSession {
    /// Peer address; fixed for the session's lifetime
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl PacketReader for UdpSession {
    async fn read_packet(&self) -> TunnelResult<Option<UdpPacket>> {
        Ok(self.inbound.pop().await)
    }
}

#[async_trait]
impl PacketWriter for UdpSession {
    async fn write_packet(&self, payload: Bytes) -> TunnelResult<()> {
        self.outbound
            .send(UdpPacket::new(self.addr, payload))
            .await
            .map_err(|_| TunnelError::ConnectionError("udp session manager stopped".to_string()))
    }
}

struct SessionEntry {
    id: u64,
    inbound: Arc<PacketQueue>,
}

/// Reads one UDP socket and dispatches packets to per-peer sessions
pub struct UdpSessionManager {
    socket: Arc<UdpSocket>,
    handler: Arc<dyn SessionHandler>,
    queue_capacity: usize,
}

impl UdpSessionManager {
    pub fn new(
        socket: Arc<UdpSocket>,
        handler: Arc<dyn SessionHandler>,
        queue_capacity: usize,
    ) -> Self {
        Self {
            socket,
            handler,
            queue_capacity,
        }
    }

    /// Run until `cancel` fires or the socket fails.
    ///
    /// Returns [`TunnelError::Cancelled`] on cancellation. Sessions are
    /// cancelled when this returns.
    pub async fn run(&self, cancel: &CancellationToken) -> TunnelResult<()> {
        info!("starting udp session manager");
        let cancel = cancel.child_token();
        let _stop_sessions = cancel.clone().drop_guard();

        let (in_tx, mut in_rx) = mpsc::channel(1);
        let (out_tx, mut out_rx) = mpsc::channel(1);

        let result = tokio::try_join!(
            self.read_loop(&cancel, in_tx),
            self.dispatch_loop(&cancel, &mut in_rx, out_tx),
            self.write_loop(&cancel, &mut out_rx),
        )
        .map(|_| ());

        let mut dropped = 0;
        while in_rx.try_recv().is_ok() {
            dropped += 1;
        }
        while out_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("dropped {} udp packets on shutdown", dropped);
        }

        match &result {
            Err(e) if e.is_cancelled() => info!("stopped udp session manager"),
            Err(e) => error!(error = %e, "stopped udp session manager"),
            Ok(()) => {}
        }
        result
    }

    async fn read_loop(
        &self,
        cancel: &CancellationToken,
        in_tx: mpsc::Sender<UdpPacket>,
    ) -> TunnelResult<()> {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        loop {
            let (n, addr) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                received = self.socket.recv_from(&mut buf) => received.map_err(|e| {
                    TunnelError::ConnectionError(format!("error reading udp packet: {}", e))
                })?,
            };
            let packet = UdpPacket::new(addr, Bytes::copy_from_slice(&buf[..n]));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                sent = in_tx.send(packet) => {
                    if sent.is_err() {
                        return Err(TunnelError::Cancelled);
                    }
                }
            }
        }
    }

    async fn dispatch_loop(
        &self,
        cancel: &CancellationToken,
        in_rx: &mut mpsc::Receiver<UdpPacket>,
        out_tx: mpsc::Sender<UdpPacket>,
    ) -> TunnelResult<()> {
        let mut sessions: HashMap<SocketAddr, SessionEntry> = HashMap::new();
        let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel::<(SocketAddr, u64)>();
        let mut next_id = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                Some((addr, id)) = stopped_rx.recv() => {
                    if sessions.get(&addr).is_some_and(|entry| entry.id == id) {
                        sessions.remove(&addr);
                        debug!(%addr, "removed udp session");
                    }
                }
                packet = in_rx.recv() => {
                    let Some(packet) = packet else {
                        return Err(TunnelError::Cancelled);
                    };
                    let addr = packet.addr;
                    let live = sessions
                        .get(&addr)
                        .is_some_and(|entry| !entry.inbound.is_closed());
                    if !live {
                        next_id += 1;
                        let entry = self.start_session(cancel, addr, next_id, &out_tx, &stopped_tx);
                        sessions.insert(addr, entry);
                    }
                    let Some(entry) = sessions.get(&addr) else {
                        continue;
                    };
                    if !entry.inbound.push(packet) {
                        debug!(
                            dropped = entry.inbound.dropped(),
                            "udp session queue full, dropped oldest packet"
                        );
                    }
                }
            }
        }
    }

    fn start_session(
        &self,
        cancel: &CancellationToken,
        addr: SocketAddr,
        id: u64,
        out_tx: &mpsc::Sender<UdpPacket>,
        stopped_tx: &mpsc::UnboundedSender<(SocketAddr, u64)>,
    ) -> SessionEntry {
        let inbound = Arc::new(PacketQueue::new(self.queue_capacity));
        let session = UdpSession {
            addr,
            inbound: inbound.clone(),
            outbound: out_tx.clone(),
        };

        let handler = self.handler.clone();
        let cancel = cancel.clone();
        let stopped_tx = stopped_tx.clone();
        tokio::spawn(async move {
            info!(%addr, "starting udp session");
            let result = handler.handle_session(&cancel, &session).await;
            match &result {
                Err(e) if !e.is_cancelled() => error!(%addr, error = %e, "stopped udp session"),
                _ => info!(%addr, "stopped udp session"),
            }
            session.inbound.close();
            let _ = stopped_tx.send((addr, id));
        });

        SessionEntry { id, inbound }
    }

    async fn write_loop(
        &self,
        cancel: &CancellationToken,
        out_rx: &mut mpsc::Receiver<UdpPacket>,
    ) -> TunnelResult<()> {
        loop {
            let packet = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                packet = out_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => return Err(TunnelError::Cancelled),
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
                sent = self.socket.send_to(&packet.payload, packet.addr) => {
                    sent.map_err(|e| {
                        TunnelError::ConnectionError(format!("error writing udp packet: {}", e))
                    })?;
                }
            }
        }
    }
}
