//! Transport layer
//!
//! Produces the raw byte streams the tunnel runs over: plain TCP, or TLS 1.3
//! toward the remote endpoint. The remote is expected to present a
//! self-signed certificate, so the client side skips certificate validation
//! entirely and instead relies on the password-derived AEAD handshake for
//! authentication.

mod tls;

pub use tls::{client_tls_config, server_tls_config};

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

/// Object-safe bound for tunnel transports: TCP, or TLS over TCP
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A boxed tunnel transport
pub type TransportStream = Box<dyn AsyncStream>;

/// Everything needed to dial the remote endpoint.
///
/// Passed by value into the pool's factory closure so the pool never holds a
/// reference back into the endpoint that owns it.
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Remote host name or IP
    pub server: String,
    pub server_port: u16,
    /// SNI for the TLS wrap; defaults to the server host
    pub sni: String,
    pub timeout: Duration,
    /// Plain TCP instead of TLS
    pub disable_tls: bool,
}

impl DialConfig {
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.server_port)
    }
}

/// Dial the remote endpoint, optionally wrapping the connection in TLS
pub async fn dial_remote(config: &DialConfig) -> io::Result<TransportStream> {
    let tcp = tokio::time::timeout(config.timeout, TcpStream::connect(config.server_addr()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    tcp.set_nodelay(true).ok();

    if config.disable_tls {
        trace!(server = %config.server_addr(), "dialed remote over plain TCP");
        return Ok(Box::new(tcp));
    }

    let connector = TlsConnector::from(client_tls_config());
    let server_name = rustls::pki_types::ServerName::try_from(config.sni.clone())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let tls = tokio::time::timeout(config.timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;

    trace!(server = %config.server_addr(), sni = %config.sni, "dialed remote over TLS");
    Ok(Box::new(tls))
}

/// Enable TCP keepalive with the given period on an accepted transport
pub fn set_tcp_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(period)
        .with_interval(period);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_plain_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = DialConfig {
            server: addr.ip().to_string(),
            server_port: addr.port(),
            sni: addr.ip().to_string(),
            timeout: Duration::from_secs(5),
            disable_tls: true,
        };

        let dial = tokio::spawn(async move { dial_remote(&config).await });
        let (accepted, _) = listener.accept().await.unwrap();
        set_tcp_keepalive(&accepted, Duration::from_secs(30)).unwrap();

        dial.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces() {
        // RFC 5737 TEST-NET-1: nothing listens there, so this either times
        // out or is rejected outright depending on the host network
        let config = DialConfig {
            server: "192.0.2.1".to_string(),
            server_port: 81,
            sni: "192.0.2.1".to_string(),
            timeout: Duration::from_millis(100),
            disable_tls: true,
        };

        assert!(dial_remote(&config).await.is_err());
    }
}
