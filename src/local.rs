//! Local endpoint
//!
//! Accepts SOCKS5 and HTTP proxy requests, routes each destination directly
//! or through the tunnel, and drives the handshake + relay for tunneled
//! streams over pooled transports.

use crate::config::ClientConfig;
use crate::crypto::{derive_master_key, Method, KEY_LEN};
use crate::pool::{Factory, Pool, PoolConfig, PooledConn};
use crate::proxy::{
    reply_bytes, Address, HttpProxyServer, HttpRequest, ProxyError, Reply, Socks5Server,
};
use crate::relay;
use crate::router::{Route, Router};
use crate::stats::Statistics;
use crate::transport::{dial_remote, DialConfig};
use crate::tunnel::{self, CipherStream};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The local proxy endpoint
pub struct LocalServer {
    config: ClientConfig,
    master_key: [u8; KEY_LEN],
    method: Method,
    router: Router,
    pool: Arc<Pool>,
    stats: Arc<Statistics>,
}

impl LocalServer {
    /// Build the endpoint: resolve the remote, set up routing and the
    /// transport pool. No sockets are bound yet.
    pub async fn new(config: ClientConfig, stats: Arc<Statistics>) -> crate::Result<Arc<Self>> {
        config.validate()?;

        if config.enable_quic {
            warn!("QUIC transport is not compiled in; staying on TCP");
        }

        let master_key = derive_master_key(&config.password)?;
        let method = Method::from_name(&config.method)
            .map_err(|e| crate::Error::Config(e.to_string()))?;

        let remote_ip = resolve_remote_ip(&config).await;
        let router = Router::new(
            config.server.clone(),
            config.server_port,
            remote_ip,
            config.disable_ipv6,
            config.direct_hosts.clone(),
        );

        // The factory owns a config snapshot by value; the pool never points
        // back at this server.
        let dial = DialConfig {
            server: config.server.clone(),
            server_port: config.server_port,
            sni: config.sni(),
            timeout: config.timeout(),
            disable_tls: config.disable_tls,
        };
        let factory: Factory = Arc::new(move || {
            let dial = dial.clone();
            Box::pin(async move { dial_remote(&dial).await })
        });
        let pool = Pool::new(PoolConfig::default(), factory);

        Ok(Arc::new(Self {
            config,
            master_key,
            method,
            router,
            pool,
            stats,
        }))
    }

    /// Bind the SOCKS5 and HTTP listeners and serve until one of them fails
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        self.pool.warm_up().await;

        let socks = Socks5Server::bind(&self.config.socks_addr(), self.config.local_port).await?;
        let socks = match self.config.socks_auth() {
            Some((user, pass)) => socks.with_auth(user, pass),
            None => socks,
        };
        let http = HttpProxyServer::bind(&self.config.http_proxy_addr()).await?;

        info!(
            server = %self.config.server_addr(),
            method = self.method.name(),
            "local endpoint ready"
        );

        let this = Arc::clone(&self);
        let socks_task = tokio::spawn(async move {
            let handler_this = Arc::clone(&this);
            socks
                .run(move |stream, target| {
                    let this = Arc::clone(&handler_this);
                    async move { this.handle_socks_connect(stream, target).await }
                })
                .await
        });

        let this = Arc::clone(&self);
        let http_task = tokio::spawn(async move {
            let handler_this = Arc::clone(&this);
            http.run(move |stream, request| {
                let this = Arc::clone(&handler_this);
                async move { this.handle_http_request(stream, request).await }
            })
            .await
        });

        let result = tokio::select! {
            r = socks_task => r,
            r = http_task => r,
        };

        self.pool.close().await;
        match result {
            Ok(serve_result) => serve_result.map_err(Into::into),
            Err(join_err) => Err(crate::Error::Config(format!(
                "proxy task failed: {}",
                join_err
            ))),
        }
    }

    /// Close the pool and refuse new streams
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }

    async fn handle_socks_connect(
        &self,
        mut stream: TcpStream,
        target: Address,
    ) -> Result<(), ProxyError> {
        match self.router.route(&target.host()) {
            Route::Direct => {
                debug!(target = %target, "direct relay");
                let Ok(remote) = self.dial_direct(&target).await else {
                    let reply = reply_bytes(Reply::HostUnreachable, &target);
                    stream.write_all(&reply).await?;
                    return Err(ProxyError::GeneralFailure(format!(
                        "direct dial to {} failed",
                        target
                    )));
                };
                let reply = reply_bytes(Reply::Succeeded, &bound_address(&stream));
                stream.write_all(&reply).await?;
                relay::direct_relay(stream, remote).await;
                Ok(())
            }
            Route::Tunnel => {
                if let Err(e) = self.validate(&target) {
                    warn!(target = %target, "rejecting request: {}", e);
                    let reply = reply_bytes(Reply::GeneralFailure, &target);
                    stream.write_all(&reply).await?;
                    return Err(ProxyError::GeneralFailure(e.to_string()));
                }

                info!(target = %target, "tunnel relay");
                let cipher_stream = match self.open_tunnel(&target).await {
                    Ok(cs) => cs,
                    Err(e) => {
                        let reply = reply_bytes(Reply::GeneralFailure, &target);
                        stream.write_all(&reply).await?;
                        return Err(e);
                    }
                };

                let reply = reply_bytes(Reply::Succeeded, &bound_address(&stream));
                stream.write_all(&reply).await?;

                self.run_tunnel_relay(cipher_stream, stream, &target).await;
                Ok(())
            }
        }
    }

    async fn handle_http_request(
        &self,
        mut stream: TcpStream,
        request: HttpRequest,
    ) -> Result<(), ProxyError> {
        let target = request.addr().clone();
        let route = self.router.route(&target.host());

        if route == Route::Tunnel {
            if let Err(e) = self.validate(&target) {
                warn!(target = %target, "rejecting request: {}", e);
                stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                return Err(ProxyError::GeneralFailure(e.to_string()));
            }
        }

        match (route, request) {
            (Route::Direct, request) => {
                debug!(target = %target, "direct relay (http)");
                let Ok(mut remote) = self.dial_direct(&target).await else {
                    stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                    return Err(ProxyError::GeneralFailure(format!(
                        "direct dial to {} failed",
                        target
                    )));
                };
                match request {
                    HttpRequest::Connect(_) => {
                        stream
                            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                            .await?;
                    }
                    HttpRequest::Absolute { payload, .. } => {
                        remote.write_all(&payload).await?;
                    }
                }
                relay::direct_relay(stream, remote).await;
                Ok(())
            }
            (Route::Tunnel, request) => {
                info!(target = %target, "tunnel relay (http)");
                let mut cipher_stream = match self.open_tunnel(&target).await {
                    Ok(cs) => cs,
                    Err(e) => {
                        stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                        return Err(e);
                    }
                };

                match request {
                    HttpRequest::Connect(_) => {
                        stream
                            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                            .await?;
                    }
                    HttpRequest::Absolute { payload, .. } => {
                        if let Err(e) = cipher_stream.write(&payload).await {
                            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                            return Err(ProxyError::GeneralFailure(e.to_string()));
                        }
                    }
                }

                self.run_tunnel_relay(cipher_stream, stream, &target).await;
                Ok(())
            }
        }
    }

    fn validate(&self, target: &Address) -> Result<(), crate::router::AddrError> {
        if self.config.disable_validate {
            return Ok(());
        }
        self.router.validate(&target.host(), target.port())
    }

    /// Acquire a pooled transport and run the handshake on it.
    ///
    /// A failed handshake consumes (and thereby closes) the transport; it
    /// never returns to the pool.
    async fn open_tunnel(
        &self,
        target: &Address,
    ) -> Result<CipherStream<PooledConn>, ProxyError> {
        let conn = match timeout(self.config.timeout(), self.pool.acquire()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(ProxyError::GeneralFailure(format!(
                    "transport pool: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(ProxyError::GeneralFailure(
                    "transport pool exhausted".to_string(),
                ))
            }
        };

        match timeout(
            self.config.timeout(),
            tunnel::connect(conn, &self.master_key, target, self.method),
        )
        .await
        {
            Ok(Ok(cs)) => Ok(cs),
            Ok(Err(e)) => {
                warn!(target = %target, "handshake with remote failed: {}", e);
                Err(ProxyError::GeneralFailure(e.to_string()))
            }
            Err(_) => {
                warn!(target = %target, "handshake with remote timed out");
                Err(ProxyError::GeneralFailure("handshake timed out".to_string()))
            }
        }
    }

    async fn run_tunnel_relay(
        &self,
        cipher_stream: CipherStream<PooledConn>,
        stream: TcpStream,
        target: &Address,
    ) {
        let (result, transport) =
            relay::relay(cipher_stream, stream, self.config.timeout(), true).await;

        debug!(
            target = %target,
            sent = result.to_tunnel,
            received = result.from_tunnel,
            reusable = result.reusable,
            "stream finished"
        );

        self.stats.add_sent(result.to_tunnel);
        self.stats.add_received(result.from_tunnel);

        if let Some(conn) = transport {
            self.pool.release(conn, result.reusable).await;
        }
    }

    async fn dial_direct(&self, target: &Address) -> std::io::Result<TcpStream> {
        let stream = timeout(
            self.config.timeout(),
            TcpStream::connect(target.to_string()),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "direct dial timed out")
        })??;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }
}

/// Resolve the remote's IP at startup for the indirect-loop guard
async fn resolve_remote_ip(config: &ClientConfig) -> Option<IpAddr> {
    if let Ok(ip) = config.server.parse::<IpAddr>() {
        return Some(ip);
    }
    match tokio::net::lookup_host(config.server_addr()).await {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()),
        Err(e) => {
            warn!("could not resolve {}: {}", config.server, e);
            None
        }
    }
}

/// The local socket address of a proxy connection, as a SOCKS bound address
fn bound_address(stream: &TcpStream) -> Address {
    match stream.local_addr() {
        Ok(std::net::SocketAddr::V4(v4)) => Address::Ipv4(*v4.ip(), v4.port()),
        Ok(std::net::SocketAddr::V6(v6)) => Address::Ipv6(*v6.ip(), v6.port()),
        Err(_) => Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED, 0),
    }
}
