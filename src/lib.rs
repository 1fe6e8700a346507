//! # Veilway
//!
//! A dual-sided encrypted TCP tunneling proxy.
//!
//! The **local endpoint** accepts SOCKS5 and HTTP proxy requests and forwards
//! them to the **remote endpoint** over a pooled, authenticated, AEAD-encrypted
//! transport whose framing is shaped like HTTP/2 traffic. The remote endpoint
//! decrypts each logical stream and relays it to the requested target host.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Proxy Front-Ends                     │
//! │            (SOCKS5, HTTP CONNECT / GET)              │
//! ├─────────────────────────────────────────────────────┤
//! │                     Router                           │
//! │         (direct vs. tunnel, address guards)          │
//! ├─────────────────────────────────────────────────────┤
//! │              Handshake + Cipher Stream               │
//! │      (target announcement, AEAD frame codec)         │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Pool                      │
//! │         (idle-aged, capped, TLS transports)          │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport Layer                    │
//! │                (TCP, TLS to the remote)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod local;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod remote;
pub mod router;
pub mod stats;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Invalid address: {0}")]
    Address(#[from] router::AddrError),

    #[error("Configuration error: {0}")]
    Config(String),
}
