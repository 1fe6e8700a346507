//! Tunnel layer - AEAD-encrypted, HTTP/2-shaped frame transport
//!
//! Provides:
//! - Frame encoding/decoding (9-byte HTTP/2-style headers)
//! - Per-frame AEAD sealing with counter-derived nonces
//! - Byte-oriented cipher streams with half-close
//! - The target-announcement handshake

mod frame;
mod handshake;
mod stream;

pub use frame::{Frame, FrameFlag, FrameHeader, FrameType, FRAME_HEADER_SIZE};
pub use handshake::{accept, acknowledge, connect, into_bulk, HandshakeRequest};
pub use stream::{CipherReadHalf, CipherStream, CipherWriteHalf};

use thiserror::Error;

/// Maximum plaintext payload carried by one DATA frame (16 KiB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport closed")]
    Closed,

    #[error("Transport ended mid-frame")]
    ShortRead,

    #[error("Bad frame header: type {frame_type:#x}, flags {flags:#x}")]
    BadHeader { frame_type: u8, flags: u8 },

    #[error("Frame payload too large: {0}")]
    FrameTooLarge(usize),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),

    #[error("Frame authentication failed")]
    AuthFailure,

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Timed out")]
    Timeout,
}
