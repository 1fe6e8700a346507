//! Key derivation
//!
//! All keys descend from the shared password through HKDF-SHA256:
//!
//! - the **master key**, extracted from the password with a fixed salt;
//! - the **header key**, used (always with AES-256-GCM) for exactly the
//!   handshake frame and its ping acknowledgment;
//! - a **stream key** per logical stream, salted with the fresh random value
//!   carried in the handshake payload so that counter nonces never repeat
//!   under the same key across streams.

use super::{CryptoError, Method, KEY_LEN, SALT_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

const MASTER_SALT: &[u8] = b"veilway-master-v1";
const HEADER_INFO: &[u8] = b"veilway header key";
const STREAM_INFO: &[u8] = b"veilway stream key";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Derive a key from the PRK into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(())
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Extract the master key from the user password
pub fn derive_master_key(password: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(Some(MASTER_SALT), password.as_bytes()).expand_key(b"master")
}

/// Derive the fixed AES-256-GCM handshake header key
pub fn derive_header_key(master: &[u8; KEY_LEN]) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(None, master).expand_key(HEADER_INFO)
}

/// Derive the bulk key for one stream from its handshake salt
pub fn derive_stream_key(
    master: &[u8; KEY_LEN],
    salt: &[u8; SALT_LEN],
    method: Method,
) -> Result<[u8; KEY_LEN], CryptoError> {
    let hkdf = Hkdf::new(Some(salt), master);
    let mut info = Vec::with_capacity(STREAM_INFO.len() + 1 + method.name().len());
    info.extend_from_slice(STREAM_INFO);
    info.push(b' ');
    info.extend_from_slice(method.name().as_bytes());
    hkdf.expand_key(&info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_basic() {
        let ikm = b"input keying material";
        let hkdf = Hkdf::new(Some(b"salt"), ikm);

        let key1 = hkdf.expand_key(b"label1").unwrap();
        let key2 = hkdf.expand_key(b"label2").unwrap();

        // Different labels should produce different keys
        assert_ne!(key1, key2);

        // Same label should produce same key
        let key1_again = hkdf.expand_key(b"label1").unwrap();
        assert_eq!(key1, key1_again);
    }

    #[test]
    fn test_master_key_deterministic() {
        let a = derive_master_key("swordfish").unwrap();
        let b = derive_master_key("swordfish").unwrap();
        assert_eq!(a, b);

        let c = derive_master_key("sword-fish").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_header_key_differs_from_master() {
        let master = derive_master_key("swordfish").unwrap();
        let header = derive_header_key(&master).unwrap();
        assert_ne!(master, header);
    }

    #[test]
    fn test_stream_key_salting() {
        let master = derive_master_key("swordfish").unwrap();

        let k1 = derive_stream_key(&master, &[0x11; SALT_LEN], Method::Aes256Gcm).unwrap();
        let k2 = derive_stream_key(&master, &[0x22; SALT_LEN], Method::Aes256Gcm).unwrap();
        assert_ne!(k1, k2);

        // Same salt, same method: both endpoints agree
        let k1_again = derive_stream_key(&master, &[0x11; SALT_LEN], Method::Aes256Gcm).unwrap();
        assert_eq!(k1, k1_again);

        // Method participates in the derivation
        let k3 =
            derive_stream_key(&master, &[0x11; SALT_LEN], Method::ChaCha20Poly1305).unwrap();
        assert_ne!(k1, k3);
    }
}
