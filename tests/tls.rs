//! TLS decoration over real sockets, with identities generated by rcgen

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use framelink::service::{Connection, Server};
use framelink::transport::{TcpProtocol, TlsClientConfig, TlsProtocol, TlsServerConfig};
use rustls::{Certificate, PrivateKey};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// TLS server on an ephemeral port that forwards every payload to a channel.
async fn tls_server(config: &TlsServerConfig) -> (Server, String, mpsc::UnboundedReceiver<Bytes>) {
    let protocol = TlsProtocol::server(TcpProtocol::prefix_length(), config).expect("server protocol");
    let server = Server::new(protocol);
    let (tx, rx) = mpsc::unbounded_channel();
    server.on_message(move |message| {
        let _ = tx.send(message.payload().clone());
        Ok(())
    });
    let addr = server.start("127.0.0.1:0").await.expect("start").to_string();
    (server, addr, rx)
}

fn tls_client(config: &TlsClientConfig) -> Connection {
    Connection::new(TlsProtocol::client(TcpProtocol::prefix_length(), config).expect("client protocol"))
}

fn client_identity(name: &str) -> (Certificate, PrivateKey) {
    let generated = rcgen::generate_simple_self_signed(vec![name.to_string()]).expect("rcgen");
    (
        Certificate(generated.cert.der().as_ref().to_vec()),
        PrivateKey(generated.key_pair.serialize_der()),
    )
}

#[tokio::test]
async fn test_tls_round_trip_with_trusted_root() {
    let (server_tls, cert) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, mut received) = tls_server(&server_tls).await;

    let client = tls_client(&TlsClientConfig::new("localhost").with_root_certificate(cert));
    let (tx, mut replies) = mpsc::unbounded_channel();
    client.on_message(move |message| {
        let _ = tx.send(message.payload().clone());
        Ok(())
    });
    assert!(client.connect(&addr).await.expect("connect"));
    assert!(client.is_secure());
    assert_eq!(client.protocol_name(), "prefix-length");

    client.send(b"over tls").await.expect("send");
    let payload = timeout(WAIT, received.recv()).await.expect("timely").expect("payload");
    assert_eq!(payload, Bytes::from_static(b"over tls"));

    wait_until(|| server.connection_count() == 1).await;
    assert_eq!(server.broadcast(b"back").await.delivered, 1);
    let reply = timeout(WAIT, replies.recv()).await.expect("timely").expect("reply");
    assert_eq!(reply, Bytes::from_static(b"back"));

    assert_eq!(server.metrics().snapshot().handshakes_success, 1);
    server.dispose().await;
}

#[tokio::test]
async fn test_untrusted_certificate_fails_connect() {
    let (server_tls, _) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (_, other_cert) = TlsServerConfig::generate_self_signed(["localhost"]).expect("other identity");
    let (server, addr, _received) = tls_server(&server_tls).await;

    let client = tls_client(&TlsClientConfig::new("localhost").with_root_certificate(other_cert));
    assert!(!client.connect(&addr).await.expect("no usage error"));
    assert!(!client.is_connected());

    wait_until(|| server.metrics().snapshot().handshakes_failed == 1).await;
    assert_eq!(server.connection_count(), 0);
    server.dispose().await;
}

#[tokio::test]
async fn test_server_name_must_match_certificate() {
    let (server_tls, cert) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, _received) = tls_server(&server_tls).await;

    let client = tls_client(&TlsClientConfig::new("example.com").with_root_certificate(cert));
    assert!(!client.connect(&addr).await.expect("no usage error"));

    server.dispose().await;
}

#[tokio::test]
async fn test_pinned_hash_accepts_matching_certificate() {
    let (server_tls, cert) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, mut received) = tls_server(&server_tls).await;

    let pin = TlsClientConfig::calculate_cert_hash(&cert);
    let client = tls_client(&TlsClientConfig::new("localhost").with_pinned_cert_hash(pin));
    assert!(client.connect(&addr).await.expect("connect"));

    client.send(b"pinned").await.expect("send");
    let payload = timeout(WAIT, received.recv()).await.expect("timely").expect("payload");
    assert_eq!(payload, Bytes::from_static(b"pinned"));

    server.dispose().await;
}

#[tokio::test]
async fn test_pinned_hash_mismatch_fails_connect() {
    let (server_tls, _) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, _received) = tls_server(&server_tls).await;

    let client = tls_client(&TlsClientConfig::new("localhost").with_pinned_cert_hash(vec![0u8; 32]));
    assert!(!client.connect(&addr).await.expect("no usage error"));
    assert!(client.metrics().snapshot().handshakes_failed >= 1);

    server.dispose().await;
}

#[tokio::test]
async fn test_certificate_predicate_decides() {
    let (server_tls, cert) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, _received) = tls_server(&server_tls).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let rejecting = TlsClientConfig::new("localhost").with_certificate_predicate(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        false
    });
    assert!(!tls_client(&rejecting).connect(&addr).await.expect("no usage error"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let expected = cert.clone();
    let accepting = TlsClientConfig::new("localhost").with_certificate_predicate(move |presented| *presented == expected);
    let client = tls_client(&accepting);
    assert!(client.connect(&addr).await.expect("connect"));

    server.dispose().await;
}

#[tokio::test]
async fn test_insecure_client_skips_verification() {
    let (server_tls, _) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, mut received) = tls_server(&server_tls).await;

    let client = tls_client(&TlsClientConfig::new("localhost").insecure());
    assert!(client.connect(&addr).await.expect("connect"));
    client.send(b"trust me").await.expect("send");
    let payload = timeout(WAIT, received.recv()).await.expect("timely").expect("payload");
    assert_eq!(payload, Bytes::from_static(b"trust me"));

    server.dispose().await;
}

#[tokio::test]
async fn test_mutual_tls() {
    let (client_cert, client_key) = client_identity("client");
    let (server_tls, server_cert) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let server_tls = server_tls.with_client_auth(vec![client_cert.clone()]);
    let (server, addr, mut received) = tls_server(&server_tls).await;

    let client = tls_client(
        &TlsClientConfig::new("localhost")
            .with_root_certificate(server_cert.clone())
            .with_client_certificate(vec![client_cert], client_key),
    );
    assert!(client.connect(&addr).await.expect("connect"));
    client.send(b"mutual").await.expect("send");
    let payload = timeout(WAIT, received.recv()).await.expect("timely").expect("payload");
    assert_eq!(payload, Bytes::from_static(b"mutual"));

    // Without a client certificate the server side never completes the handshake.
    let anonymous = tls_client(&TlsClientConfig::new("localhost").with_root_certificate(server_cert));
    let _ = anonymous.connect(&addr).await.expect("no usage error");
    wait_until(|| server.metrics().snapshot().handshakes_failed == 1).await;
    assert_eq!(server.connection_count(), 1);

    server.dispose().await;
}

#[tokio::test]
async fn test_plaintext_client_cannot_reach_tls_server() {
    let (server_tls, _) = TlsServerConfig::generate_self_signed(["localhost"]).expect("identity");
    let (server, addr, mut received) = tls_server(&server_tls).await;

    let client = Connection::new(TcpProtocol::prefix_length());
    assert!(client.connect(&addr).await.expect("connect"));
    let _ = client.send(b"hello?").await;

    wait_until(|| server.metrics().snapshot().handshakes_failed == 1).await;
    assert!(received.try_recv().is_err());
    assert_eq!(server.connection_count(), 0);

    server.dispose().await;
}
