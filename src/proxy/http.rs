//! HTTP proxy implementation
//!
//! Accepts both `CONNECT host:port` and absolute-form requests
//! (`GET http://host/path HTTP/1.1`). CONNECT is handed to the handler
//! untouched; absolute-form requests are rewritten to origin form and the
//! rewritten bytes travel to the target ahead of the relayed stream.
//! The handler owns the HTTP response, so routing can refuse a target with
//! 502 before any upstream traffic exists.

use super::{Address, ProxyError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// A parsed proxy request
#[derive(Debug)]
pub enum HttpRequest {
    /// `CONNECT host:port`; the handler answers 200 on success
    Connect(Address),
    /// Absolute-form request rewritten to origin form; `payload` goes to the
    /// target before the bidirectional relay starts
    Absolute { addr: Address, payload: Vec<u8> },
}

impl HttpRequest {
    pub fn addr(&self) -> &Address {
        match self {
            HttpRequest::Connect(addr) => addr,
            HttpRequest::Absolute { addr, .. } => addr,
        }
    }
}

/// HTTP proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
}

impl HttpProxyServer {
    /// Bind the HTTP proxy listener
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", addr);

        Ok(Self { listener })
    }

    /// Accept and handle incoming connections
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, HttpRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ProxyError>> + Send,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New HTTP proxy connection from {}", peer_addr);

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, handler).await {
                    debug!("HTTP proxy connection error: {}", e);
                }
            });
        }
    }

    async fn handle_connection<F, Fut>(stream: TcpStream, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, HttpRequest) -> Fut,
        Fut: std::future::Future<Output = Result<(), ProxyError>>,
    {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;

        let parts: Vec<&str> = request_line.trim().split_whitespace().collect();
        if parts.len() < 3 {
            let mut stream = reader.into_inner();
            stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Err(ProxyError::GeneralFailure("invalid request line".into()));
        }

        let method = parts[0];
        let target = parts[1];
        let version = parts[2];

        // Headers, in order
        let mut headers: Vec<(String, String)> = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_string(), value.trim().to_string()));
            }
        }

        if method.eq_ignore_ascii_case("CONNECT") {
            let addr = Address::parse(target)?;
            debug!("HTTP CONNECT to {}", addr);
            let stream = reader.into_inner();
            return handler(stream, HttpRequest::Connect(addr)).await;
        }

        // Absolute form: METHOD http://host[:port]/path
        let Some((addr, origin_target)) = parse_absolute_uri(target) else {
            let mut stream = reader.into_inner();
            stream
                .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                .await?;
            return Err(ProxyError::GeneralFailure(format!(
                "unsupported request: {} {}",
                method, target
            )));
        };

        debug!("HTTP {} to {} via proxy", method, addr);

        let mut payload = format!("{} {} {}\r\n", method, origin_target, version).into_bytes();
        for (key, value) in &headers {
            // Hop-by-hop proxy headers stay here
            if key.eq_ignore_ascii_case("proxy-connection")
                || key.eq_ignore_ascii_case("proxy-authorization")
            {
                continue;
            }
            payload.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        payload.extend_from_slice(b"\r\n");

        // Body bytes the reader may have buffered past the headers
        payload.extend_from_slice(reader.buffer());
        let stream = reader.into_inner();

        handler(stream, HttpRequest::Absolute { addr, payload }).await
    }
}

/// Split `http://host[:port]/path` into the target address and origin-form path
fn parse_absolute_uri(uri: &str) -> Option<(Address, String)> {
    let rest = uri.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };

    let addr = if authority.contains(':') {
        Address::parse(authority).ok()?
    } else {
        Address::parse(&format!("{}:80", authority)).ok()?
    };

    Some((addr, path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_absolute_uri() {
        let (addr, path) = parse_absolute_uri("http://example.com/index.html").unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 80));
        assert_eq!(path, "/index.html");

        let (addr, path) = parse_absolute_uri("http://example.com:8080").unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(path, "/");

        assert!(parse_absolute_uri("ftp://example.com/").is_none());
        assert!(parse_absolute_uri("example.com:443").is_none());
    }

    #[tokio::test]
    async fn test_connect_request() {
        let server = HttpProxyServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.listener.local_addr().unwrap();

        tokio::spawn(async move {
            server
                .run(|mut stream, request| async move {
                    assert!(matches!(&request, HttpRequest::Connect(a)
                        if *a == Address::Domain("example.com".to_string(), 443)));
                    stream
                        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                        .await?;
                    Ok(())
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_absolute_form_rewrite() {
        let server = HttpProxyServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.listener.local_addr().unwrap();

        tokio::spawn(async move {
            server
                .run(|mut stream, request| async move {
                    let HttpRequest::Absolute { addr, payload } = request else {
                        panic!("expected absolute-form request");
                    };
                    assert_eq!(addr, Address::Domain("example.com".to_string(), 80));

                    let text = String::from_utf8(payload).unwrap();
                    assert!(text.starts_with("GET /page HTTP/1.1\r\n"));
                    assert!(text.contains("Host: example.com\r\n"));
                    // Hop-by-hop header removed
                    assert!(!text.to_lowercase().contains("proxy-connection"));

                    stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
                    Ok(())
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                b"GET http://example.com/page HTTP/1.1\r\n\
                  Host: example.com\r\n\
                  Proxy-Connection: keep-alive\r\n\r\n",
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 200"));
    }
}
