//! AEAD sealing for tunnel frames
//!
//! Each direction of a stream owns one [`CipherContext`]: a symmetric key plus
//! a 64-bit counter that starts at zero and advances once per sealed frame.
//! The nonce for frame `k` is the little-endian encoding of `k`, zero-padded
//! to the AEAD nonce width. Counters never reset within a stream; fresh
//! streams get fresh salted keys, so a (key, nonce) pair is never reused.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// Bulk cipher selector, as carried in the handshake payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// AES-256-GCM (selector 0x1); also the fixed handshake header cipher
    Aes256Gcm,
    /// ChaCha20-Poly1305 (selector 0x2)
    ChaCha20Poly1305,
}

impl Method {
    /// Wire selector byte for the handshake payload
    pub fn as_byte(self) -> u8 {
        match self {
            Method::Aes256Gcm => 0x1,
            Method::ChaCha20Poly1305 => 0x2,
        }
    }

    /// Decode a selector byte; anything unrecognized falls back to `default`
    pub fn from_selector(b: u8, default: Method) -> Method {
        match b {
            0x1 => Method::Aes256Gcm,
            0x2 => Method::ChaCha20Poly1305,
            _ => default,
        }
    }

    /// Parse a configuration name like `aes-256-gcm`
    pub fn from_name(name: &str) -> Result<Method, CryptoError> {
        match name {
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            "chacha20-poly1305" => Ok(Method::ChaCha20Poly1305),
            other => Err(CryptoError::UnknownMethod(other.to_string())),
        }
    }

    /// Configuration name of this method
    pub fn name(self) -> &'static str {
        match self {
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    fn algorithm(self) -> &'static ring::aead::Algorithm {
        match self {
            Method::Aes256Gcm => &AES_256_GCM,
            Method::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

/// Nonce strategy for the sealing direction.
///
/// Bulk streams use counter nonces under a key no other stream shares.
/// The handshake runs under the long-lived header key, which seals one frame
/// per stream; there the nonce must be random, and the receiver opens with
/// the nonce carried on the wire either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceMode {
    Counter,
    Random,
}

/// One direction of one stream: key, method, and monotonic frame counter
pub struct CipherContext {
    key: LessSafeKey,
    method: Method,
    nonce_mode: NonceMode,
    seq: u64,
}

impl CipherContext {
    /// Create a counter-nonce context with the counter at zero
    pub fn new(key: &[u8; KEY_LEN], method: Method) -> Result<Self, CryptoError> {
        Self::with_nonce_mode(key, method, NonceMode::Counter)
    }

    /// Create a context with an explicit nonce strategy
    pub fn with_nonce_mode(
        key: &[u8; KEY_LEN],
        method: Method,
        nonce_mode: NonceMode,
    ) -> Result<Self, CryptoError> {
        let unbound = UnboundKey::new(method.algorithm(), key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            method,
            nonce_mode,
            seq: 0,
        })
    }

    /// Seal `buf` in place, returning the nonce and tag for the wire.
    ///
    /// Advances the counter by one.
    pub fn seal(
        &mut self,
        aad: &[u8],
        buf: &mut [u8],
    ) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN]), CryptoError> {
        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::from(aad), buf)
            .map_err(|_| CryptoError::Encryption)?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(tag.as_ref());

        Ok((nonce_bytes, tag_bytes))
    }

    /// Open `buf` (ciphertext followed by tag) in place with the given nonce.
    ///
    /// Returns the plaintext length and advances the counter by one.
    pub fn open(
        &mut self,
        aad: &[u8],
        nonce: &[u8; NONCE_LEN],
        buf: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let nonce = Nonce::assume_unique_for_key(*nonce);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(aad), buf)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        self.seq += 1;
        Ok(plaintext.len())
    }

    /// The method this context seals with
    pub fn method(&self) -> Method {
        self.method
    }

    /// Number of frames sealed or opened so far
    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        match self.nonce_mode {
            NonceMode::Counter => nonce[..8].copy_from_slice(&self.seq.to_le_bytes()),
            NonceMode::Random => super::random_bytes(&mut nonce),
        }
        self.seq += 1;
        nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(method: Method) {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = CipherContext::new(&key, method).unwrap();
        let mut opener = CipherContext::new(&key, method).unwrap();

        let plaintext = b"Hello, World!";
        let aad = b"header bytes";

        let mut buf = plaintext.to_vec();
        let (nonce, tag) = sealer.seal(aad, &mut buf).unwrap();
        buf.extend_from_slice(&tag);

        let len = opener.open(aad, &nonce, &mut buf).unwrap();
        assert_eq!(&buf[..len], plaintext);
        assert_eq!(sealer.seq(), 1);
        assert_eq!(opener.seq(), 1);
    }

    #[test]
    fn test_seal_open_aes() {
        roundtrip(Method::Aes256Gcm);
    }

    #[test]
    fn test_seal_open_chacha() {
        roundtrip(Method::ChaCha20Poly1305);
    }

    #[test]
    fn test_counter_nonce_progression() {
        let key = [0x01u8; KEY_LEN];
        let mut ctx = CipherContext::new(&key, Method::Aes256Gcm).unwrap();

        let mut first = vec![0u8; 8];
        let (nonce0, _) = ctx.seal(&[], &mut first).unwrap();
        assert_eq!(&nonce0[..8], &0u64.to_le_bytes());

        let mut second = vec![0u8; 8];
        let (nonce1, _) = ctx.seal(&[], &mut second).unwrap();
        assert_eq!(&nonce1[..8], &1u64.to_le_bytes());
        assert_eq!(ctx.seq(), 2);
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = CipherContext::new(&key, Method::Aes256Gcm).unwrap();
        let mut opener = CipherContext::new(&key, Method::Aes256Gcm).unwrap();

        let mut buf = b"payload".to_vec();
        let (nonce, tag) = sealer.seal(&[], &mut buf).unwrap();
        buf.extend_from_slice(&tag);

        // Flip one ciphertext bit
        buf[0] ^= 0x01;

        assert!(matches!(
            opener.open(&[], &nonce, &mut buf),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let key = [0x42u8; KEY_LEN];
        let mut sealer = CipherContext::new(&key, Method::ChaCha20Poly1305).unwrap();
        let mut opener = CipherContext::new(&key, Method::ChaCha20Poly1305).unwrap();

        let mut buf = b"payload".to_vec();
        let (nonce, tag) = sealer.seal(b"header-a", &mut buf).unwrap();
        buf.extend_from_slice(&tag);

        assert!(opener.open(b"header-b", &nonce, &mut buf).is_err());
    }

    #[test]
    fn test_method_selector_roundtrip() {
        assert_eq!(
            Method::from_selector(0x1, Method::ChaCha20Poly1305),
            Method::Aes256Gcm
        );
        assert_eq!(
            Method::from_selector(0x2, Method::Aes256Gcm),
            Method::ChaCha20Poly1305
        );
        // Unspecified selector falls back to the default
        assert_eq!(
            Method::from_selector(0x0, Method::Aes256Gcm),
            Method::Aes256Gcm
        );
        assert_eq!(Method::from_name("aes-256-gcm").unwrap(), Method::Aes256Gcm);
        assert!(Method::from_name("rc4").is_err());
    }
}
