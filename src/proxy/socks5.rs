//! SOCKS5 proxy implementation (RFC 1928)
//!
//! Handles method selection, optional username/password authentication
//! (RFC 1929), and request parsing. CONNECT requests are handed to the
//! caller-provided handler, which owns the final reply: this lets the
//! routing layer answer with a general failure before any tunnel traffic
//! is produced. UDP ASSOCIATE is bookkeeping only: the reply binds to
//! loopback on the SOCKS port and the association lives in a map keyed by
//! the client's UDP port until the TCP control channel closes.

use super::{Address, ProxyError};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Encode a SOCKS5 reply for the given code and bound address
pub fn reply_bytes(reply: Reply, addr: &Address) -> Vec<u8> {
    let mut buf = vec![SOCKS_VERSION, reply as u8, 0x00];
    buf.extend_from_slice(&addr.encode());
    buf
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    /// Optional username/password authentication
    auth: Option<(String, String)>,
    /// SOCKS port, echoed in UDP ASSOCIATE replies
    local_port: u16,
    /// Live UDP associations keyed by client UDP port
    associated_udp: Arc<Mutex<HashMap<u16, std::net::SocketAddr>>>,
}

impl Socks5Server {
    /// Bind the SOCKS5 listener
    pub async fn bind(addr: &str, local_port: u16) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", addr);

        Ok(Self {
            listener,
            auth: None,
            local_port,
            associated_udp: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.auth = Some((username, password));
        self
    }

    /// Whether a client UDP port currently has a live association
    pub async fn is_associated(&self, port: u16) -> bool {
        self.associated_udp.lock().await.contains_key(&port)
    }

    /// Accept and handle incoming connections.
    ///
    /// The handler receives CONNECT requests and must write the SOCKS reply
    /// itself, so it can refuse a target before opening any tunnel stream.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, Address) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), ProxyError>> + Send,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let handler = handler.clone();
            let auth = self.auth.clone();
            let local_port = self.local_port;
            let associated = Arc::clone(&self.associated_udp);

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, peer_addr, auth, local_port, associated, handler)
                        .await
                {
                    debug!("SOCKS5 connection error: {}", e);
                }
            });
        }
    }

    async fn handle_connection<F, Fut>(
        mut stream: TcpStream,
        peer_addr: std::net::SocketAddr,
        auth: Option<(String, String)>,
        local_port: u16,
        associated: Arc<Mutex<HashMap<u16, std::net::SocketAddr>>>,
        handler: F,
    ) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, Address) -> Fut,
        Fut: std::future::Future<Output = Result<(), ProxyError>>,
    {
        let mut buf = [0u8; 262];

        // Greeting
        stream.read_exact(&mut buf[..2]).await?;
        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let nmethods = buf[1] as usize;
        stream.read_exact(&mut buf[..nmethods]).await?;

        let method = if auth.is_some() {
            if buf[..nmethods].contains(&(AuthMethod::UsernamePassword as u8)) {
                AuthMethod::UsernamePassword
            } else {
                AuthMethod::NoAcceptable
            }
        } else if buf[..nmethods].contains(&(AuthMethod::NoAuth as u8)) {
            AuthMethod::NoAuth
        } else {
            AuthMethod::NoAcceptable
        };

        stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

        if method == AuthMethod::NoAcceptable {
            return Err(ProxyError::AuthenticationFailed);
        }

        if method == AuthMethod::UsernamePassword {
            Self::check_userpass(&mut stream, &mut buf, auth.as_ref()).await?;
        }

        // Request
        stream.read_exact(&mut buf[..4]).await?;
        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidSocksVersion(buf[0]));
        }

        let command = match Command::try_from(buf[1]) {
            Ok(c) => c,
            Err(e) => {
                let reply = reply_bytes(
                    Reply::CommandNotSupported,
                    &Address::Ipv4(Ipv4Addr::UNSPECIFIED, 0),
                );
                stream.write_all(&reply).await?;
                return Err(e);
            }
        };
        let address = match Self::read_address(&mut stream, buf[3], &mut buf).await {
            Ok(a) => a,
            Err(e) => {
                let reply = reply_bytes(
                    Reply::AddressTypeNotSupported,
                    &Address::Ipv4(Ipv4Addr::UNSPECIFIED, 0),
                );
                stream.write_all(&reply).await?;
                return Err(e);
            }
        };

        debug!("SOCKS5 {:?} to {}", command, address);

        match command {
            Command::Connect => handler(stream, address).await,
            Command::UdpAssociate => {
                Self::handle_udp_associate(stream, peer_addr, address, local_port, associated)
                    .await
            }
            Command::Bind => {
                let reply = reply_bytes(Reply::CommandNotSupported, &address);
                stream.write_all(&reply).await?;
                Err(ProxyError::UnsupportedCommand(command as u8))
            }
        }
    }

    async fn check_userpass(
        stream: &mut TcpStream,
        buf: &mut [u8; 262],
        auth: Option<&(String, String)>,
    ) -> Result<(), ProxyError> {
        let Some((expected_user, expected_pass)) = auth else {
            return Ok(());
        };

        // RFC 1929 subnegotiation: VER ULEN UNAME PLEN PASSWD
        stream.read_exact(&mut buf[..2]).await?;
        let ulen = buf[1] as usize;
        stream.read_exact(&mut buf[..ulen]).await?;
        let username = String::from_utf8_lossy(&buf[..ulen]).to_string();

        stream.read_exact(&mut buf[..1]).await?;
        let plen = buf[0] as usize;
        stream.read_exact(&mut buf[..plen]).await?;
        let password = String::from_utf8_lossy(&buf[..plen]).to_string();

        let success = username == *expected_user && password == *expected_pass;
        stream
            .write_all(&[0x01, if success { 0x00 } else { 0x01 }])
            .await?;

        if !success {
            return Err(ProxyError::AuthenticationFailed);
        }
        Ok(())
    }

    async fn read_address(
        stream: &mut TcpStream,
        addr_type: u8,
        buf: &mut [u8; 262],
    ) -> Result<Address, ProxyError> {
        match addr_type {
            0x01 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                let mut port_buf = [0u8; 2];
                stream.read_exact(&mut port_buf).await?;
                Ok(Address::Ipv4(
                    Ipv4Addr::from(ip),
                    u16::from_be_bytes(port_buf),
                ))
            }
            0x03 => {
                stream.read_exact(&mut buf[..1]).await?;
                let len = buf[0] as usize;
                stream.read_exact(&mut buf[..len]).await?;
                let domain = String::from_utf8_lossy(&buf[..len]).to_string();
                let mut port_buf = [0u8; 2];
                stream.read_exact(&mut port_buf).await?;
                Ok(Address::Domain(domain, u16::from_be_bytes(port_buf)))
            }
            0x04 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                let mut port_buf = [0u8; 2];
                stream.read_exact(&mut port_buf).await?;
                Ok(Address::Ipv6(
                    Ipv6Addr::from(ip),
                    u16::from_be_bytes(port_buf),
                ))
            }
            other => Err(ProxyError::UnsupportedAddressType(other)),
        }
    }

    /// Record the association and park on the control channel until the
    /// client drops it. No datagrams are relayed here.
    async fn handle_udp_associate(
        mut stream: TcpStream,
        peer_addr: std::net::SocketAddr,
        address: Address,
        local_port: u16,
        associated: Arc<Mutex<HashMap<u16, std::net::SocketAddr>>>,
    ) -> Result<(), ProxyError> {
        let client_udp_port = address.port();

        let bound = Address::Ipv4(Ipv4Addr::LOCALHOST, local_port);
        stream.write_all(&reply_bytes(Reply::Succeeded, &bound)).await?;

        associated.lock().await.insert(client_udp_port, peer_addr);
        debug!(
            "UDP association registered for client port {} ({})",
            client_udp_port, peer_addr
        );

        // The association lives exactly as long as the TCP control channel
        let mut sink = [0u8; 512];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }

        associated.lock().await.remove(&client_udp_port);
        debug!(
            "UDP association released for client port {}",
            client_udp_port
        );
        Ok(())
    }
}

/// Drive a SOCKS5 CONNECT as a client; used by tests and tooling
pub async fn client_connect(stream: &mut TcpStream, target: &Address) -> Result<u8, ProxyError> {
    stream.write_all(&[SOCKS_VERSION, 1, 0x00]).await?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;
    if resp != [SOCKS_VERSION, 0x00] {
        error!("SOCKS5 method selection failed: {:?}", resp);
        return Err(ProxyError::AuthenticationFailed);
    }

    let mut request = vec![SOCKS_VERSION, Command::Connect as u8, 0x00];
    request.extend_from_slice(&target.encode());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let reply_code = head[1];

    // Drain the bound address
    match head[3] {
        0x01 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        other => return Err(ProxyError::UnsupportedAddressType(other)),
    }

    Ok(reply_code)
}
