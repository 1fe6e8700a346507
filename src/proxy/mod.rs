//! Proxy front-ends
//!
//! Provides:
//! - SOCKS5 proxy server (RFC 1928)
//! - HTTP proxy server (CONNECT and absolute-form requests)
//! - The SOCKS5 address encoding shared with the tunnel handshake

mod http;
mod socks5;

pub use http::{HttpProxyServer, HttpRequest};
pub use socks5::{client_connect, reply_bytes, Reply, Socks5Server};

use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("General failure: {0}")]
    GeneralFailure(String),
}

/// Proxy target address, wire-encoded as `ATYP || ADDR || PORT` (RFC 1928 §5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4(Ipv4Addr, u16),
    /// IPv6 address and port
    Ipv6(Ipv6Addr, u16),
    /// Domain name and port
    Domain(String, u16),
}

/// SOCKS5 address type markers
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host without the port
    pub fn host(&self) -> String {
        match self {
            Address::Ipv4(ip, _) => ip.to_string(),
            Address::Ipv6(ip, _) => ip.to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Parse a `host:port` string (IPv6 hosts in brackets)
    pub fn parse(target: &str) -> Result<Self, ProxyError> {
        let (host, port_str) = target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidAddress(target.to_string()))?;

        let port: u16 = port_str
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(target.to_string()))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            Ok(Address::Ipv4(ip, port))
        } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
            Ok(Address::Ipv6(ip, port))
        } else if host.is_empty() {
            Err(ProxyError::InvalidAddress(target.to_string()))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }

    /// Encode to the SOCKS5 wire form `ATYP || ADDR || PORT(BE)`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 16 + 2);
        match self {
            Address::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf
    }

    /// Decode the SOCKS5 wire form, requiring the slice to be consumed exactly
    pub fn decode(buf: &[u8]) -> Result<Self, ProxyError> {
        let err = || ProxyError::InvalidAddress(format!("{} bytes", buf.len()));

        let (addr, consumed) = match *buf.first().ok_or_else(err)? {
            ATYP_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return Err(err());
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                (Address::Ipv4(ip, port), 7)
            }
            ATYP_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return Err(err());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                (Address::Ipv6(Ipv6Addr::from(octets), port), 19)
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(err)? as usize;
                if len == 0 || buf.len() < 2 + len + 2 {
                    return Err(err());
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| ProxyError::InvalidAddress("non-utf8 domain".to_string()))?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                (Address::Domain(domain, port), 2 + len + 2)
            }
            atyp => return Err(ProxyError::UnsupportedAddressType(atyp)),
        };

        if consumed != buf.len() {
            return Err(ProxyError::InvalidAddress("trailing bytes".to_string()));
        }
        Ok(addr)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
