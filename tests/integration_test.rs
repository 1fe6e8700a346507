//! Integration tests for veilway
//!
//! Exercises the full local-to-remote data path over loopback:
//! - handshake, relay, and transport reuse across sequential streams
//! - target rejection at the remote
//! - the SOCKS5 and HTTP front-ends of a complete local endpoint
//! - the TLS transport against a self-signed remote

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use veilway::config::{ClientConfig, ServerConfig};
use veilway::crypto::{derive_master_key, Method};
use veilway::local::LocalServer;
use veilway::pool::{Factory, Pool, PoolConfig, TransportStream};
use veilway::proxy::{client_connect, Address};
use veilway::relay::relay;
use veilway::remote::RemoteServer;
use veilway::stats::Statistics;
use veilway::transport::{dial_remote, DialConfig};
use veilway::tunnel;

const PASSWORD: &str = "integration test password";

fn server_config(port: u16, disable_tls: bool, disable_validate: bool) -> ServerConfig {
    ServerConfig {
        server_port: port,
        password: PASSWORD.to_string(),
        method: "aes-256-gcm".to_string(),
        timeout: 30,
        tls_cert: None,
        tls_key: None,
        tls_host: Some("localhost".to_string()),
        disable_tls,
        enable_quic: false,
        disable_validate,
    }
}

/// Start a remote endpoint on an ephemeral port
async fn spawn_remote(disable_tls: bool, disable_validate: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = server_config(addr.port(), disable_tls, disable_validate);
    let server = RemoteServer::new(config, Statistics::new()).unwrap();
    tokio::spawn(server.serve(listener));

    addr
}

/// A miniature HTTP/1.0 origin: reads the whole request, answers, closes
async fn spawn_target() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let _ = stream.read_to_end(&mut request).await;
                let _ = stream
                    .write_all(b"HTTP/1.0 200 OK\r\n\r\nhello from target")
                    .await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    let client = TcpStream::connect(addr).await.unwrap();
    (client, accept.await.unwrap())
}

fn counting_factory(remote: SocketAddr, dials: Arc<AtomicUsize>) -> Factory {
    Arc::new(move || {
        let dials = Arc::clone(&dials);
        Box::pin(async move {
            dials.fetch_add(1, Ordering::SeqCst);
            let stream = TcpStream::connect(remote).await?;
            Ok(Box::new(stream) as TransportStream)
        })
    })
}

/// CONNECT happy path plus transport reuse: two sequential streams must
/// share one pooled transport, each with a fresh zero-counter bulk stream.
#[tokio::test]
async fn test_connect_happy_path_and_reuse() {
    let target_addr = spawn_target().await;
    let remote_addr = spawn_remote(true, true).await;
    let master = derive_master_key(PASSWORD).unwrap();

    let dials = Arc::new(AtomicUsize::new(0));
    let pool = Pool::new(
        PoolConfig::default(),
        counting_factory(remote_addr, Arc::clone(&dials)),
    );

    for round in 0..2 {
        let conn = pool.acquire().await.unwrap();
        let target = Address::Ipv4("127.0.0.1".parse().unwrap(), target_addr.port());

        let cipher_stream = tunnel::connect(conn, &master, &target, Method::Aes256Gcm)
            .await
            .unwrap();

        let (mut app, proxy_side) = tcp_pair().await;
        let relay_task = tokio::spawn(relay(
            cipher_stream,
            proxy_side,
            Duration::from_secs(10),
            true,
        ));

        app.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        app.shutdown().await.unwrap();

        let mut response = Vec::new();
        app.read_to_end(&mut response).await.unwrap();
        assert!(
            response.starts_with(b"HTTP/1.0 200 OK"),
            "round {}: unexpected response {:?}",
            round,
            String::from_utf8_lossy(&response)
        );

        let (result, transport) = relay_task.await.unwrap();
        assert!(result.reusable, "round {}: stream should be reusable", round);
        assert_eq!(result.to_tunnel, 18);
        pool.release(transport.unwrap(), result.reusable).await;
    }

    // Both streams rode the same transport
    assert_eq!(dials.load(Ordering::SeqCst), 1);
}

/// A malicious handshake naming a private target is dropped before any ping
#[tokio::test]
async fn test_remote_rejects_private_target() {
    let remote_addr = spawn_remote(true, false).await;
    let master = derive_master_key(PASSWORD).unwrap();

    let conn = TcpStream::connect(remote_addr).await.unwrap();
    let target = Address::Ipv4("10.0.0.5".parse().unwrap(), 22);

    let result = tunnel::connect(conn, &master, &target, Method::Aes256Gcm).await;
    assert!(result.is_err(), "private target must not be acknowledged");
}

/// A client with the wrong password never gets past the header cipher
#[tokio::test]
async fn test_remote_rejects_wrong_password() {
    let remote_addr = spawn_remote(true, true).await;
    let wrong_master = derive_master_key("not the password").unwrap();

    let conn = TcpStream::connect(remote_addr).await.unwrap();
    let target = Address::Domain("example.com".to_string(), 80);

    let result = tunnel::connect(conn, &wrong_master, &target, Method::Aes256Gcm).await;
    assert!(result.is_err());
}

/// The TLS transport works end to end against the self-signed remote
#[tokio::test]
async fn test_tls_transport_roundtrip() {
    let target_addr = spawn_target().await;
    let remote_addr = spawn_remote(false, true).await;
    let master = derive_master_key(PASSWORD).unwrap();

    let dial = DialConfig {
        server: "127.0.0.1".to_string(),
        server_port: remote_addr.port(),
        sni: "localhost".to_string(),
        timeout: Duration::from_secs(10),
        disable_tls: false,
    };
    let transport = dial_remote(&dial).await.unwrap();

    let target = Address::Ipv4("127.0.0.1".parse().unwrap(), target_addr.port());
    let mut cipher_stream = tunnel::connect(transport, &master, &target, Method::ChaCha20Poly1305)
        .await
        .unwrap();

    cipher_stream.write(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    cipher_stream.close_write().await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = cipher_stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
    }
    assert!(response.starts_with(b"HTTP/1.0 200 OK"));
}

fn client_config(remote_port: u16, local_port: u16, disable_validate: bool) -> ClientConfig {
    ClientConfig {
        server: "127.0.0.1".to_string(),
        server_port: remote_port,
        password: PASSWORD.to_string(),
        method: "aes-256-gcm".to_string(),
        local_port,
        bind_all: false,
        timeout: 10,
        disable_tls: true,
        disable_ipv6: false,
        enable_quic: false,
        direct_hosts: Vec::new(),
        auth_username: None,
        auth_password: None,
        tls_sni: None,
        disable_validate,
    }
}

/// Start a full local endpoint; returns its SOCKS port (HTTP is +1000)
async fn spawn_local(remote_port: u16, disable_validate: bool) -> u16 {
    // Claim an ephemeral port, then hand it to the endpoint
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_port = probe.local_addr().unwrap().port();
    drop(probe);

    let config = client_config(remote_port, local_port, disable_validate);
    let server = LocalServer::new(config, Statistics::new()).await.unwrap();
    tokio::spawn(server.run());

    // Give the listeners a moment to come up
    for _ in 0..50 {
        if TcpStream::connect(("127.0.0.1", local_port)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    local_port
}

/// Full stack: SOCKS5 CONNECT through local and remote to a real target
#[tokio::test]
async fn test_socks5_full_stack() {
    let target_addr = spawn_target().await;
    let remote_addr = spawn_remote(true, true).await;
    let socks_port = spawn_local(remote_addr.port(), true).await;

    let mut client = TcpStream::connect(("127.0.0.1", socks_port)).await.unwrap();
    let target = Address::Ipv4("127.0.0.1".parse().unwrap(), target_addr.port());
    let code = client_connect(&mut client, &target).await.unwrap();
    assert_eq!(code, 0x00);

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.0 200 OK"));
}

/// Loop guard: asking the proxy to tunnel to its own remote yields a SOCKS5
/// general failure and no tunnel stream
#[tokio::test]
async fn test_socks5_loop_guard() {
    let remote_addr = spawn_remote(true, true).await;
    let socks_port = spawn_local(remote_addr.port(), false).await;

    let mut client = TcpStream::connect(("127.0.0.1", socks_port)).await.unwrap();
    let target = Address::Ipv4("127.0.0.1".parse().unwrap(), remote_addr.port());
    let code = client_connect(&mut client, &target).await.unwrap();
    assert_eq!(code, 0x01, "loop target must get a general failure");
}

/// Full stack over the HTTP front-end: CONNECT and absolute-form GET
#[tokio::test]
async fn test_http_proxy_full_stack() {
    let target_addr = spawn_target().await;
    let remote_addr = spawn_remote(true, true).await;
    let socks_port = spawn_local(remote_addr.port(), true).await;
    let http_port = socks_port + 1000;

    // CONNECT
    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    client
        .write_all(
            format!(
                "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                target_addr.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).await.unwrap();
    assert!(established.starts_with(b"HTTP/1.1 200"));

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    client.shutdown().await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.0 200 OK"));

    // Absolute form
    let mut client = TcpStream::connect(("127.0.0.1", http_port)).await.unwrap();
    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                target_addr.port()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert!(response.starts_with(b"HTTP/1.0 200 OK"));
}
