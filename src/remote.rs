//! Remote endpoint
//!
//! Accepts inbound transports (TLS by default), performs the reverse
//! handshake, dials the announced target, and runs the relay. After a clean,
//! reusable close the same transport loops back to accept another stream;
//! streams on one transport are strictly sequential.

use crate::config::ServerConfig;
use crate::crypto::{derive_master_key, Method, KEY_LEN};
use crate::router::is_private_ip;
use crate::stats::Statistics;
use crate::transport::{server_tls_config, set_tcp_keepalive, TransportStream};
use crate::tunnel::{self, TunnelError};
use crate::{relay, Error};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// The remote tunnel endpoint
pub struct RemoteServer {
    config: ServerConfig,
    master_key: [u8; KEY_LEN],
    default_method: Method,
    stats: Arc<Statistics>,
}

impl RemoteServer {
    pub fn new(config: ServerConfig, stats: Arc<Statistics>) -> crate::Result<Arc<Self>> {
        config.validate()?;

        if config.enable_quic {
            warn!("QUIC transport is not compiled in; staying on TCP");
        }

        let master_key = derive_master_key(&config.password)?;
        let default_method =
            Method::from_name(&config.method).map_err(|e| Error::Config(e.to_string()))?;

        Ok(Arc::new(Self {
            config,
            master_key,
            default_method,
            stats,
        }))
    }

    /// Bind and serve forever. A bind failure is the only fatal error.
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        let tls_acceptor = if self.config.disable_tls {
            info!("TLS disabled, accepting plain TCP transports");
            None
        } else {
            let host = self.config.tls_host.clone().unwrap_or_default();
            let tls_config = server_tls_config(
                self.config.tls_cert.as_deref(),
                self.config.tls_key.as_deref(),
                &host,
            )?;
            Some(TlsAcceptor::from(tls_config))
        };

        let listen = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| self.config.listen_addr());
        info!(
            listen = %listen,
            method = self.default_method.name(),
            "remote endpoint ready"
        );

        loop {
            let (tcp, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept error: {}", e);
                    continue;
                }
            };
            debug!("new transport from {}", peer_addr);

            tcp.set_nodelay(true).ok();
            if let Err(e) = set_tcp_keepalive(&tcp, self.config.timeout()) {
                warn!("failed to enable keepalive for {}: {}", peer_addr, e);
            }

            let this = Arc::clone(&self);
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let transport: TransportStream = match acceptor {
                    Some(acceptor) => match acceptor.accept(tcp).await {
                        Ok(tls) => Box::new(tls),
                        Err(e) => {
                            debug!("TLS accept from {} failed: {}", peer_addr, e);
                            return;
                        }
                    },
                    None => Box::new(tcp),
                };
                this.serve_transport(transport, peer_addr).await;
            });
        }
    }

    /// Accept handshakes and relay streams until the transport stops being
    /// reusable or the client goes away.
    ///
    /// The wait for the next handshake is unbounded: pooled client
    /// transports sit idle between streams, and TCP keepalive reaps the
    /// dead ones.
    async fn serve_transport(&self, mut transport: TransportStream, peer: std::net::SocketAddr) {
        loop {
            let accepted =
                match tunnel::accept(transport, &self.master_key, self.default_method).await {
                    Ok(accepted) => accepted,
                    Err(TunnelError::Closed) => {
                        debug!("transport from {} closed", peer);
                        return;
                    }
                    Err(e) => {
                        warn!("handshake from {} failed: {}", peer, e);
                        return;
                    }
                };
            let (request, mut hs) = accepted;

            // The remote never relays into its own network
            if !self.config.disable_validate {
                if let Err(reason) = check_target(&request.addr.host()) {
                    warn!("rejecting target {} from {}: {}", request.addr, peer, reason);
                    return;
                }
            }

            info!(target = %request.addr, "dialing target");
            let target = match timeout(
                self.config.timeout(),
                TcpStream::connect(request.addr.to_string()),
            )
            .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!("dial {} failed: {}", request.addr, e);
                    return;
                }
                Err(_) => {
                    warn!("dial {} timed out", request.addr);
                    return;
                }
            };
            target.set_nodelay(true).ok();

            // Target is up: acknowledge, then switch to the bulk cipher
            if let Err(e) = tunnel::acknowledge(&mut hs, &request.salt).await {
                warn!("sending handshake ack to {} failed: {}", peer, e);
                return;
            }
            let bulk = match tunnel::into_bulk(hs, &self.master_key, &request) {
                Ok(bulk) => bulk,
                Err(e) => {
                    warn!("bulk cipher setup failed: {}", e);
                    return;
                }
            };

            let (result, recovered) =
                relay::relay(bulk, target, self.config.timeout(), true).await;

            debug!(
                target = %request.addr,
                sent = result.to_tunnel,
                received = result.from_tunnel,
                reusable = result.reusable,
                "stream finished"
            );
            self.stats.add_sent(result.to_tunnel);
            self.stats.add_received(result.from_tunnel);

            let Some(next) = recovered else { return };
            if !result.reusable {
                debug!("transport from {} not reusable, closing", peer);
                return;
            }
            transport = next;
        }
    }
}

/// Targets a remote must never dial: itself, loopback names, private space
fn check_target(host: &str) -> Result<(), &'static str> {
    if host.is_empty() {
        return Err("empty host");
    }
    if host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" {
        return Err("loopback target");
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err("private address target");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_target() {
        assert!(check_target("example.com").is_ok());
        assert!(check_target("93.184.216.34").is_ok());

        assert!(check_target("").is_err());
        assert!(check_target("localhost").is_err());
        assert!(check_target("LOCALHOST").is_err());
        assert!(check_target("127.0.0.1").is_err());
        assert!(check_target("10.0.0.5").is_err());
        assert!(check_target("192.168.1.1").is_err());
        assert!(check_target("fe80::1").is_err());
    }
}
