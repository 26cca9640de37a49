//! Integration tests for the HTTP/3 tunneler against an in-process
//! QUIC proxy

use async_trait::async_trait;
use authtunnel_transport::{
    ensure_crypto_provider, DiscardEvents, PacketReader, PacketWriter, ProxyTarget, TcpTunneler,
    TlsOptions, TunnelError, TunnelResult, UdpPacket, UdpTunneler,
};
use authtunnel_transport_h3::Http3Tunneler;
use bytes::{Buf, Bytes};
use http::{Method, Response, StatusCode};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

type ProxyConnection = h3::server::Connection<h3_quinn::Connection, Bytes>;
type ProxyStream = h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>;

/// What the test proxy advertises
#[derive(Clone, Copy)]
struct ProxySettings {
    extended_connect: bool,
    h3_datagrams: bool,
    quic_datagrams: bool,
}

impl ProxySettings {
    fn full() -> Self {
        Self {
            extended_connect: true,
            h3_datagrams: true,
            quic_datagrams: true,
        }
    }
}

/// QUIC endpoint on loopback with a self-signed certificate speaking `h3`
fn proxy_endpoint(settings: ProxySettings) -> (quinn::Endpoint, SocketAddr) {
    ensure_crypto_provider();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    tls.alpn_protocols = vec![b"h3".to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls).unwrap();
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    if !settings.quic_datagrams {
        let mut transport = quinn::TransportConfig::default();
        transport.datagram_receive_buffer_size(None);
        config.transport_config(Arc::new(transport));
    }

    let endpoint = quinn::Endpoint::server(config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();
    (endpoint, addr)
}

/// Accept one QUIC connection and its HTTP/3 handshake
async fn accept_h3(
    endpoint: &quinn::Endpoint,
    settings: ProxySettings,
) -> (ProxyConnection, quinn::Connection) {
    let quic = endpoint.accept().await.unwrap().await.unwrap();
    let h3 = h3::server::builder()
        .enable_extended_connect(settings.extended_connect)
        .enable_datagram(settings.h3_datagrams)
        .build::<_, Bytes>(h3_quinn::Connection::new(quic.clone()))
        .await
        .unwrap();
    (h3, quic)
}

/// Accept the next request on `h3`
async fn next_request(h3: &mut ProxyConnection) -> (http::Request<()>, ProxyStream) {
    let resolver = h3.accept().await.unwrap().unwrap();
    resolver.resolve_request().await.unwrap()
}

async fn respond(stream: &mut ProxyStream, status: StatusCode) {
    let response = Response::builder().status(status).body(()).unwrap();
    stream.send_response(response).await.unwrap();
}

fn tunneler_for(addr: SocketAddr) -> Http3Tunneler {
    let tls = TlsOptions::default()
        .with_insecure_skip_verify()
        .build_client_config()
        .unwrap();
    Http3Tunneler::new(ProxyTarget::new(
        "example.com:9999",
        addr.to_string(),
        Some(tls),
    ))
}

struct NoPackets;

#[async_trait]
impl PacketReader for NoPackets {
    async fn read_packet(&self) -> TunnelResult<Option<UdpPacket>> {
        Ok(None)
    }
}

#[async_trait]
impl PacketWriter for NoPackets {
    async fn write_packet(&self, _payload: Bytes) -> TunnelResult<()> {
        Ok(())
    }
}

fn cleartext_tunneler() -> Http3Tunneler {
    Http3Tunneler::new(ProxyTarget::new("example.com:9999", "127.0.0.1:1", None))
}

#[tokio::test]
async fn test_tcp_requires_tls() {
    let (_client, mut local) = tokio::io::duplex(1024);
    let result = cleartext_tunneler()
        .tunnel_tcp(&CancellationToken::new(), &DiscardEvents, &mut local, "")
        .await;
    assert!(result.unwrap_err().is_unsupported());
}

#[tokio::test]
async fn test_udp_requires_tls() {
    let result = cleartext_tunneler()
        .tunnel_udp(&CancellationToken::new(), &DiscardEvents, &NoPackets, "")
        .await;
    assert!(result.unwrap_err().is_unsupported());
}

#[tokio::test]
async fn test_cancelled_before_handshake() {
    // nothing answers QUIC on this socket, so the handshake never completes
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tls = authtunnel_transport::TlsOptions::default()
        .with_insecure_skip_verify()
        .build_client_config()
        .unwrap();
    let tunneler = Http3Tunneler::new(ProxyTarget::new(
        "example.com:9999",
        silent.local_addr().unwrap().to_string(),
        Some(tls),
    ));

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let (_client, mut local) = tokio::io::duplex(1024);
    let result = tunneler
        .tunnel_tcp(&cancel, &DiscardEvents, &mut local, "")
        .await;
    assert!(result.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_tcp_connect_exchanges_data() {
    let (endpoint, addr) = proxy_endpoint(ProxySettings::full());
    let proxy = tokio::spawn(async move {
        let (mut h3, _quic) = accept_h3(&endpoint, ProxySettings::full()).await;
        let (request, mut stream) = next_request(&mut h3).await;
        assert_eq!(request.method(), Method::CONNECT);
        assert_eq!(
            request.uri().authority().map(|a| a.as_str()),
            Some("example.com:9999")
        );
        assert_eq!(
            request.headers().get(http::header::AUTHORIZATION).unwrap(),
            "Pomerium JWT"
        );
        respond(&mut stream, StatusCode::OK).await;

        let mut received = Vec::new();
        while received.len() < 4 {
            let mut chunk = stream.recv_data().await.unwrap().unwrap();
            received.extend_from_slice(&chunk.copy_to_bytes(chunk.remaining()));
        }
        assert_eq!(received, [1, 2, 3, 4]);

        stream.send_data(Bytes::from_static(&[5, 6, 7, 8])).await.unwrap();
        stream.finish().await.unwrap();
        // hold the connection until the client is done with it
        while let Ok(Some(_)) = stream.recv_data().await {}
    });

    let (mut client, mut local) = tokio::io::duplex(1024);
    let tunnel = tokio::spawn(async move {
        tunneler_for(addr)
            .tunnel_tcp(&CancellationToken::new(), &DiscardEvents, &mut local, "JWT")
            .await
    });

    client.write_all(&[1, 2, 3, 4]).await.unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, [5, 6, 7, 8]);

    let result = tokio::time::timeout(Duration::from_secs(5), tunnel)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "unexpected result {:?}", result);
    drop(client);
    let _ = tokio::time::timeout(Duration::from_secs(5), proxy).await;
}

#[tokio::test]
async fn test_tcp_forbidden_is_unauthorized() {
    let (endpoint, addr) = proxy_endpoint(ProxySettings::full());
    tokio::spawn(async move {
        let (mut h3, _quic) = accept_h3(&endpoint, ProxySettings::full()).await;
        let (_, mut stream) = next_request(&mut h3).await;
        respond(&mut stream, StatusCode::FORBIDDEN).await;
        let _ = stream.finish().await;
        let _ = h3.accept().await;
    });

    let (_client, mut local) = tokio::io::duplex(1024);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        tunneler_for(addr).tunnel_tcp(&CancellationToken::new(), &DiscardEvents, &mut local, ""),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(TunnelError::Unauthorized)));
}

/// Packet source and sink backed by channels
struct ChannelPackets {
    inbound: Mutex<mpsc::Receiver<UdpPacket>>,
    outbound: mpsc::Sender<Bytes>,
}

#[async_trait]
impl PacketReader for ChannelPackets {
    async fn read_packet(&self) -> TunnelResult<Option<UdpPacket>> {
        Ok(self.inbound.lock().await.recv().await)
    }
}

#[async_trait]
impl PacketWriter for ChannelPackets {
    async fn write_packet(&self, payload: Bytes) -> TunnelResult<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| TunnelError::ConnectionError("receiver gone".to_string()))
    }
}

#[tokio::test]
async fn test_udp_datagram_exchange() {
    let (endpoint, addr) = proxy_endpoint(ProxySettings::full());
    tokio::spawn(async move {
        let (mut h3, quic) = accept_h3(&endpoint, ProxySettings::full()).await;
        let (request, mut stream) = next_request(&mut h3).await;
        assert_eq!(request.method(), Method::CONNECT);
        assert_eq!(
            request.uri().path(),
            "/.well-known/masque/udp/example.com/9999/"
        );
        assert_eq!(
            request.extensions().get::<h3::ext::Protocol>(),
            Some(&h3::ext::Protocol::CONNECT_UDP)
        );
        respond(&mut stream, StatusCode::OK).await;
        // the proxy closing its side of the stream keeps the session up
        stream.finish().await.unwrap();

        while let Ok(datagram) = quic.read_datagram().await {
            // quarter stream id 0, context id 0, payload
            assert_eq!(&datagram[..2], b"\x00\x00");
            let mut reply = datagram.to_vec();
            reply.extend_from_slice(b" back");
            if quic.send_datagram(Bytes::from(reply)).is_err() {
                break;
            }
        }
        drop(stream);
    });

    let (in_tx, in_rx) = mpsc::channel(8);
    let (out_tx, mut out_rx) = mpsc::channel(8);
    let packets = ChannelPackets {
        inbound: Mutex::new(in_rx),
        outbound: out_tx,
    };

    let cancel = CancellationToken::new();
    let tunnel = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tunneler_for(addr)
                .tunnel_udp(&cancel, &DiscardEvents, &packets, "JWT")
                .await
        })
    };

    let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
    for payload in [&b"first"[..], &b"second"[..]] {
        in_tx
            .send(UdpPacket::new(peer, Bytes::copy_from_slice(payload)))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], [payload, &b" back"[..]].concat());
    }

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), tunnel)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(TunnelError::Cancelled)));
}

async fn udp_against(settings: ProxySettings) -> TunnelResult<()> {
    let (endpoint, addr) = proxy_endpoint(settings);
    tokio::spawn(async move {
        let (mut h3, _quic) = accept_h3(&endpoint, settings).await;
        // a CONNECT-UDP arriving here would be answered; the client must not send one
        if let Ok(Some(resolver)) = h3.accept().await {
            if let Ok((_, mut stream)) = resolver.resolve_request().await {
                respond(&mut stream, StatusCode::OK).await;
            }
        }
    });

    tokio::time::timeout(
        Duration::from_secs(5),
        tunneler_for(addr).tunnel_udp(&CancellationToken::new(), &DiscardEvents, &NoPackets, ""),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_udp_requires_extended_connect() {
    let result = udp_against(ProxySettings {
        extended_connect: false,
        ..ProxySettings::full()
    })
    .await;
    assert!(result.unwrap_err().is_unsupported());
}

#[tokio::test]
async fn test_udp_requires_http_datagrams() {
    let result = udp_against(ProxySettings {
        h3_datagrams: false,
        ..ProxySettings::full()
    })
    .await;
    assert!(result.unwrap_err().is_unsupported());
}

#[tokio::test]
async fn test_udp_requires_quic_datagrams() {
    let result = udp_against(ProxySettings {
        quic_datagrams: false,
        ..ProxySettings::full()
    })
    .await;
    assert!(result.unwrap_err().is_unsupported());
}
