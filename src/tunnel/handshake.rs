//! Target-announcement handshake
//!
//! The first frame on every logical stream announces the target address and
//! negotiates the bulk cipher. It is sealed with the **header key** — a fixed
//! AES-256-GCM key derived from the password, independent of the negotiated
//! method — and answered by a ping frame under the same key. Everything after
//! the ping uses a fresh, salted bulk key with counters restarted at zero.
//!
//! Payload layout:
//!
//! ```text
//! ATYP(1) || ADDR(var) || PORT(2, BE) || CIPHER(1) || SALT(16)
//! ```
//!
//! The salt serves two purposes: it scopes the bulk key to this stream (the
//! same plaintext never seals identically on two streams), and its first four
//! bytes must be echoed back in the ping payload, so a recorded ping cannot
//! acknowledge a later handshake.

use super::{CipherStream, Frame, TunnelError};
use crate::crypto::{
    self, derive_header_key, derive_stream_key, Method, KEY_LEN, SALT_LEN,
};
use crate::proxy::Address;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// A decoded handshake announcement, as seen by the remote endpoint
pub struct HandshakeRequest {
    pub addr: Address,
    pub method: Method,
    pub salt: [u8; SALT_LEN],
}

/// Client side: announce `addr` on a fresh transport and wait for the ping.
///
/// On success the transport is rewrapped in a bulk [`CipherStream`] keyed for
/// exactly this stream. On failure the transport is consumed and dropped; it
/// must not return to the pool.
pub async fn connect<T>(
    transport: T,
    master_key: &[u8; KEY_LEN],
    addr: &Address,
    method: Method,
) -> Result<CipherStream<T>, TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let header_key = derive_header_key(master_key)?;
    let mut hs = CipherStream::handshake(transport, &header_key)?;

    let salt = crypto::generate_salt();
    let mut payload = addr.encode();
    payload.push(method.as_byte());
    payload.extend_from_slice(&salt);

    hs.write_frame(Frame::data(Bytes::from(payload))).await?;

    let reply = hs.read_frame().await?;
    if !reply.is_ping() {
        hs.mark_unusable();
        return Err(TunnelError::HandshakeRejected(format!(
            "expected ping frame, got type {:?} flags {:?}",
            reply.header.frame_type, reply.header.flags
        )));
    }
    if reply.payload.as_ref() != &salt[..4] {
        hs.mark_unusable();
        return Err(TunnelError::HandshakeRejected(
            "ping did not echo the handshake token".to_string(),
        ));
    }

    debug!(target = %addr, method = method.name(), "handshake acknowledged");

    let bulk_key = derive_stream_key(master_key, &salt, method)?;
    let transport = hs.into_inner();
    Ok(CipherStream::new(transport, &bulk_key, method)?)
}

/// Remote side: read and decode one handshake frame.
///
/// Returns the announcement together with the still header-keyed stream; the
/// caller validates the target, sends the acknowledgment with
/// [`acknowledge`], and swaps to the bulk cipher with [`into_bulk`].
pub async fn accept<T>(
    transport: T,
    master_key: &[u8; KEY_LEN],
    default_method: Method,
) -> Result<(HandshakeRequest, CipherStream<T>), TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let header_key = derive_header_key(master_key)?;
    let mut hs = CipherStream::handshake(transport, &header_key)?;

    let frame = hs.read_frame().await?;
    if !frame.is_data() {
        hs.mark_unusable();
        return Err(TunnelError::HandshakeRejected(format!(
            "first frame must be DATA, got {:?}",
            frame.header.frame_type
        )));
    }

    let payload = frame.payload;
    if payload.len() <= 1 + SALT_LEN {
        hs.mark_unusable();
        return Err(TunnelError::HandshakeRejected(
            "payload length is invalid".to_string(),
        ));
    }

    let salt_start = payload.len() - SALT_LEN;
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&payload[salt_start..]);

    let method = Method::from_selector(payload[salt_start - 1], default_method);

    let addr = Address::decode(&payload[..salt_start - 1]).map_err(|e| {
        hs.mark_unusable();
        TunnelError::HandshakeRejected(format!("bad target address: {}", e))
    })?;

    Ok((HandshakeRequest { addr, method, salt }, hs))
}

/// Remote side: acknowledge an accepted handshake with a ping frame echoing
/// the first four salt bytes.
pub async fn acknowledge<T>(
    hs: &mut CipherStream<T>,
    salt: &[u8; SALT_LEN],
) -> Result<(), TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut echo = [0u8; 4];
    echo.copy_from_slice(&salt[..4]);
    hs.write_frame(Frame::ping(echo)).await
}

/// Swap the header-keyed stream for the bulk stream of this announcement.
///
/// Counters restart at zero under the salted per-stream key.
pub fn into_bulk<T>(
    hs: CipherStream<T>,
    master_key: &[u8; KEY_LEN],
    request: &HandshakeRequest,
) -> Result<CipherStream<T>, TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let bulk_key = derive_stream_key(master_key, &request.salt, request.method)?;
    Ok(CipherStream::new(hs.into_inner(), &bulk_key, request.method)?)
}
