//! Cryptographic primitives for veilway
//!
//! This module provides:
//! - AEAD frame sealing (AES-256-GCM, ChaCha20-Poly1305) with counter nonces
//! - HKDF-SHA256 key derivation from the shared password
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::{CipherContext, Method, NonceMode};
pub use kdf::{derive_header_key, derive_master_key, derive_stream_key, Hkdf};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of AEAD nonce in bytes (both supported constructions)
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of the per-stream key salt carried in the handshake payload
pub const SALT_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Unknown cipher method: {0}")]
    UnknownMethod(String),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("Failed to generate random bytes");
}

/// Generate a random per-stream salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    random_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }
}
