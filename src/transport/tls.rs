//! TLS configuration for both tunnel endpoints
//!
//! The client config orders cipher suites the way Chrome does and offers the
//! usual browser ALPN list, so the ClientHello blends in with ordinary web
//! traffic. Certificate validation is deliberately skipped: the remote runs
//! on a self-signed certificate and authentication happens inside the tunnel
//! via the password-derived AEAD handshake, not through PKI.
//!
//! The server config loads a PEM certificate pair when configured and
//! otherwise generates a throwaway self-signed certificate at startup.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring as ring_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::io;
use std::sync::Arc;
use tracing::info;

/// Build the client TLS config used by the pool's transport factory
pub fn client_tls_config() -> Arc<ClientConfig> {
    let provider = CryptoProvider {
        cipher_suites: browser_cipher_suites(),
        ..ring_provider::default_provider()
    };

    let mut config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(SkipServerVerification::new())
        .with_no_client_auth();

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config.resumption = rustls::client::Resumption::default();

    Arc::new(config)
}

/// Build the server TLS config: PEM files when given, self-signed otherwise
pub fn server_tls_config(
    cert_path: Option<&str>,
    key_path: Option<&str>,
    host: &str,
) -> io::Result<Arc<ServerConfig>> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => {
            info!(cert, "loading TLS certificate");
            (load_certs(cert)?, load_private_key(key)?)
        }
        _ => {
            info!("no TLS certificate configured, generating self-signed");
            generate_self_signed(host)?
        }
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(Arc::new(config))
}

/// Chrome cipher suite order (TLS 1.3 first, then 1.2)
fn browser_cipher_suites() -> Vec<rustls::SupportedCipherSuite> {
    use rustls::crypto::ring::cipher_suite;

    vec![
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates found in {}", path),
        ));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = io::BufReader::new(std::fs::File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path),
        )
    })
}

fn generate_self_signed(
    host: &str,
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let name = if host.is_empty() { "localhost" } else { host };
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.into()], key))
}

/// Accepts whatever certificate the remote presents.
///
/// The tunnel's security comes from the AEAD layer; TLS here is camouflage
/// and transport encryption for observers who don't hold the password.
#[derive(Debug)]
struct SkipServerVerification(CryptoProvider);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(ring_provider::default_provider()))
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
