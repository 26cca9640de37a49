//! End-to-end tunnel tests against an in-process HTTP/1.1 proxy

use authtunnel_client::{
    DiscardEvents, JwtCache, MemoryJwtCache, Tunnel, TunnelConfig, TunnelError, TunnelResult,
};
use authtunnel_transport::{EventSink, LocalStream, TcpTunneler};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(stream.read_u8().await.unwrap());
    }
    String::from_utf8(head).unwrap()
}

/// Proxy that redirects requests without `Authorization: Pomerium <token>`
/// to a login page and echoes for the others
async fn start_proxy(token: String) -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (heads_tx, heads_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let heads_tx = heads_tx.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let authorized = head.contains(&format!("Authorization: Pomerium {}\r\n", token));
                let _ = heads_tx.send(head);

                if !authorized {
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 302 Found\r\nLocation: https://login.example.com\r\n\r\n",
                        )
                        .await;
                    return;
                }
                stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    (addr, heads_rx)
}

/// Service-account JWT expiring 2100-01-01
fn service_account_token() -> String {
    let exp: u64 = 4_102_444_800;
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &serde_json::json!({ "sub": "service-account", "exp": exp }),
        &jsonwebtoken::EncodingKey::from_secret(b"proxy-signing-key"),
    )
    .unwrap()
}

fn cleartext_config(proxy: SocketAddr) -> TunnelConfig {
    TunnelConfig::builder()
        .destination("redis.example.com:6379")
        .proxy_host(proxy.to_string())
        .no_tls()
        .service_account(service_account_token())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_listener_logs_in_and_tunnels() {
    let token = service_account_token();
    let (proxy, mut heads) = start_proxy(token.clone()).await;
    let cache = Arc::new(MemoryJwtCache::new());
    let tunnel = Arc::new(
        Tunnel::new(cleartext_config(proxy))
            .unwrap()
            .with_cache(cache.clone()),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = {
        let cancel = cancel.clone();
        let tunnel = tunnel.clone();
        tokio::spawn(async move { tunnel.serve_listener(&cancel, listener).await })
    };

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"PING");

    // first attempt without a token, the retry with the service account
    let first = heads.recv().await.unwrap();
    assert!(first.starts_with("CONNECT redis.example.com:6379 HTTP/1.1\r\n"));
    assert!(!first.contains("Authorization"));
    let second = heads.recv().await.unwrap();
    assert!(second.contains(&format!("Authorization: Pomerium {}\r\n", token)));

    assert_eq!(cache.load_jwt(&tunnel.cache_key()).unwrap(), token);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_run_surfaces_terminal_error() {
    // a proxy that never accepts the token
    let (proxy, _heads) = start_proxy("other-token".to_string()).await;
    let tunnel = Tunnel::new(cleartext_config(proxy))
        .unwrap()
        .with_cache(Arc::new(MemoryJwtCache::new()));

    let (_client, mut local) = tokio::io::duplex(64);
    let result = tunnel
        .run(&CancellationToken::new(), &mut local, &DiscardEvents)
        .await;
    assert!(matches!(result, Err(TunnelError::Unauthenticated)));
}

/// TCP tunneler that reports `unsupported` and counts its calls
#[derive(Default)]
struct Unsupported {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl TcpTunneler for Unsupported {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    async fn tunnel_tcp(
        &self,
        _cancel: &CancellationToken,
        _events: &dyn EventSink,
        _local: &mut dyn LocalStream,
        _token: &str,
    ) -> TunnelResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TunnelError::Unsupported("not here".to_string()))
    }
}

#[tokio::test]
async fn test_injected_tunneler_skips_probe() {
    let unsupported = Arc::new(Unsupported::default());
    let tunnel = Tunnel::new(cleartext_config("127.0.0.1:1".parse().unwrap()))
        .unwrap()
        .with_cache(Arc::new(MemoryJwtCache::new()))
        .with_tcp_tunneler(unsupported.clone());

    let (_client, mut local) = tokio::io::duplex(64);
    let result = tunnel
        .run(&CancellationToken::new(), &mut local, &DiscardEvents)
        .await;
    assert!(result.unwrap_err().is_unsupported());
    assert_eq!(unsupported.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_udp_listener_round_trip() {
    // proxy that upgrades to connect-udp and echoes capsules verbatim
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = proxy.accept().await.unwrap();
        let head = read_head(&mut stream).await;
        assert!(head.starts_with(
            "GET /.well-known/masque/udp/redis.example.com/6379/ HTTP/1.1\r\n"
        ));
        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
            .await
            .unwrap();
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });

    let tunnel = Arc::new(
        Tunnel::new(cleartext_config(proxy_addr))
            .unwrap()
            .with_cache(Arc::new(MemoryJwtCache::new())),
    );
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let socket_addr = socket.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let manager = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tunnel
                .run_udp_session_manager(&cancel, socket, Arc::new(DiscardEvents))
                .await
        })
    };

    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"hello", socket_addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(from, socket_addr);

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), manager)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TunnelError::Cancelled)));
}
