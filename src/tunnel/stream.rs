//! Cipher stream: a byte-oriented view over sealed frames
//!
//! Wraps a raw transport in the frame codec. Writers split arbitrary buffers
//! into DATA frames of at most [`MAX_PAYLOAD_SIZE`](super::MAX_PAYLOAD_SIZE)
//! plaintext bytes; readers open one frame at a time and buffer the plaintext
//! for partial consumption.
//!
//! On the wire each frame is the 9-byte plaintext header followed by
//! `length` bytes of ciphertext, the nonce, and the 16-byte tag. Bulk
//! streams derive the nonce from the per-direction frame counter; the
//! receiver always opens with the nonce as transmitted. The header
//! participates in the seal as additional data, so a tampered length or
//! type fails authentication even though the header travels in the clear.
//!
//! Both halves share a sticky `unusable` flag. Any authentication failure,
//! framing violation, or transport error sets it; an unusable stream's
//! transport must never go back into the connection pool.

use super::{Frame, FrameHeader, FrameType, TunnelError, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::crypto::{CipherContext, CryptoError, Method, NonceMode, KEY_LEN, NONCE_LEN, TAG_LEN};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// An encrypted frame stream over a raw transport
pub struct CipherStream<T> {
    reader: CipherReadHalf<T>,
    writer: CipherWriteHalf<T>,
}

/// Read side of a cipher stream
pub struct CipherReadHalf<T> {
    transport: ReadHalf<T>,
    cipher: CipherContext,
    /// Decrypted, not-yet-consumed bytes
    buffer: BytesMut,
    saw_fin: bool,
    unusable: Arc<AtomicBool>,
}

/// Write side of a cipher stream
pub struct CipherWriteHalf<T> {
    transport: WriteHalf<T>,
    cipher: CipherContext,
    fin_sent: bool,
    unusable: Arc<AtomicBool>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> CipherStream<T> {
    /// Bind a transport to a fresh cipher context pair.
    ///
    /// Send and receive counters both start at zero.
    pub fn new(transport: T, key: &[u8; KEY_LEN], method: Method) -> Result<Self, CryptoError> {
        Self::with_nonce_mode(transport, key, method, NonceMode::Counter)
    }

    /// Bind a transport for the handshake exchange: AES-256-GCM under the
    /// header key with random nonces, since that key outlives any one stream.
    pub fn handshake(transport: T, header_key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        Self::with_nonce_mode(
            transport,
            header_key,
            Method::Aes256Gcm,
            NonceMode::Random,
        )
    }

    fn with_nonce_mode(
        transport: T,
        key: &[u8; KEY_LEN],
        method: Method,
        nonce_mode: NonceMode,
    ) -> Result<Self, CryptoError> {
        let (read_half, write_half) = tokio::io::split(transport);
        let unusable = Arc::new(AtomicBool::new(false));

        Ok(Self {
            reader: CipherReadHalf {
                transport: read_half,
                cipher: CipherContext::with_nonce_mode(key, method, nonce_mode)?,
                buffer: BytesMut::new(),
                saw_fin: false,
                unusable: Arc::clone(&unusable),
            },
            writer: CipherWriteHalf {
                transport: write_half,
                cipher: CipherContext::with_nonce_mode(key, method, nonce_mode)?,
                fin_sent: false,
                unusable,
            },
        })
    }

    /// Split into independently owned halves for a bidirectional relay
    pub fn into_split(self) -> (CipherReadHalf<T>, CipherWriteHalf<T>) {
        (self.reader, self.writer)
    }

    /// Recombine halves produced by [`into_split`](Self::into_split)
    pub fn reunite(reader: CipherReadHalf<T>, writer: CipherWriteHalf<T>) -> Self {
        Self { reader, writer }
    }

    /// Recover the underlying transport (e.g. to return it to the pool)
    pub fn into_inner(self) -> T {
        self.reader.transport.unsplit(self.writer.transport)
    }

    pub fn is_unusable(&self) -> bool {
        self.reader.unusable.load(Ordering::Acquire)
    }

    pub fn mark_unusable(&self) {
        self.reader.unusable.store(true, Ordering::Release);
    }

    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        self.writer.write_frame(frame).await
    }

    pub async fn read_frame(&mut self) -> Result<Frame, TunnelError> {
        self.reader.read_frame().await
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        self.writer.write(data).await
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        self.reader.read(buf).await
    }

    pub async fn close_write(&mut self) -> Result<(), TunnelError> {
        self.writer.close_write().await
    }
}

impl<T: AsyncWrite> CipherWriteHalf<T> {
    /// Seal and send one frame: header, ciphertext, nonce, tag
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), TunnelError> {
        if frame.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(frame.payload.len()));
        }

        let header = frame.header.encode();

        let mut wire =
            Vec::with_capacity(FRAME_HEADER_SIZE + frame.payload.len() + NONCE_LEN + TAG_LEN);
        wire.extend_from_slice(&header);
        wire.extend_from_slice(&frame.payload);

        let (nonce, tag) = self
            .cipher
            .seal(&header, &mut wire[FRAME_HEADER_SIZE..])
            .map_err(|e| {
                self.mark_unusable();
                TunnelError::Crypto(e)
            })?;
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&tag);

        let result = async {
            self.transport.write_all(&wire).await?;
            self.transport.flush().await
        }
        .await;

        if let Err(e) = result {
            self.mark_unusable();
            return Err(TunnelError::Io(e));
        }
        Ok(())
    }

    /// Send arbitrary bytes, chunked into DATA frames
    pub async fn write(&mut self, data: &[u8]) -> Result<(), TunnelError> {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            self.write_frame(Frame::data(Bytes::copy_from_slice(chunk)))
                .await?;
        }
        Ok(())
    }

    /// Emit a FIN frame and refuse further writes on this side.
    ///
    /// Calls after the first are no-ops.
    pub async fn close_write(&mut self) -> Result<(), TunnelError> {
        if self.fin_sent {
            return Ok(());
        }
        self.write_frame(Frame::fin()).await?;
        self.fin_sent = true;
        Ok(())
    }

    /// Whether a FIN has been sent on this side
    pub fn fin_sent(&self) -> bool {
        self.fin_sent
    }

    /// Frames sealed so far on this side
    pub fn frames_sent(&self) -> u64 {
        self.cipher.seq()
    }

    pub fn mark_unusable(&self) {
        self.unusable.store(true, Ordering::Release);
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }
}

impl<T: AsyncRead> CipherReadHalf<T> {
    /// Read and open one frame.
    ///
    /// [`TunnelError::Closed`] means the transport reached EOF cleanly before
    /// any frame byte arrived; an EOF mid-frame is [`TunnelError::ShortRead`].
    /// Every error path leaves the stream marked unusable.
    pub async fn read_frame(&mut self) -> Result<Frame, TunnelError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];

        // First byte separately, to tell a clean EOF from a truncated frame.
        match self.transport.read(&mut header[..1]).await {
            Ok(0) => {
                self.mark_unusable();
                return Err(TunnelError::Closed);
            }
            Ok(_) => {}
            Err(e) => {
                self.mark_unusable();
                return Err(TunnelError::Io(e));
            }
        }
        self.read_exact(&mut header[1..]).await?;

        let parsed = FrameHeader::decode(&header).map_err(|e| {
            self.mark_unusable();
            e
        })?;
        if parsed.length > MAX_PAYLOAD_SIZE {
            self.mark_unusable();
            return Err(TunnelError::FrameTooLarge(parsed.length));
        }

        // ciphertext || nonce || tag
        let mut sealed = vec![0u8; parsed.length + NONCE_LEN + TAG_LEN];
        self.read_exact(&mut sealed).await?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[parsed.length..parsed.length + NONCE_LEN]);

        // Close the nonce gap so ciphertext and tag are contiguous for opening
        sealed.copy_within(parsed.length + NONCE_LEN.., parsed.length);
        sealed.truncate(parsed.length + TAG_LEN);

        let plain_len = self.cipher.open(&header, &nonce, &mut sealed).map_err(|e| {
            self.mark_unusable();
            match e {
                CryptoError::AuthenticationFailed => TunnelError::AuthFailure,
                other => TunnelError::Crypto(other),
            }
        })?;
        sealed.truncate(plain_len);

        Ok(Frame {
            header: parsed,
            payload: Bytes::from(sealed),
        })
    }

    /// Byte-oriented read; `Ok(0)` signals an orderly FIN from the peer.
    ///
    /// Partial reads are permitted: leftover plaintext stays buffered for the
    /// next call.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        loop {
            if !self.buffer.is_empty() {
                let n = buf.len().min(self.buffer.len());
                buf[..n].copy_from_slice(&self.buffer[..n]);
                self.buffer.advance(n);
                return Ok(n);
            }
            if self.saw_fin {
                return Ok(0);
            }

            let frame = self.read_frame().await?;
            match frame.header.frame_type {
                FrameType::Data => {
                    self.buffer.extend_from_slice(&frame.payload);
                }
                FrameType::RstStream if frame.is_fin() => {
                    self.saw_fin = true;
                    return Ok(0);
                }
                FrameType::RstStream => {
                    // A ping has no business arriving mid-stream
                    self.mark_unusable();
                    return Err(TunnelError::UnexpectedFrame(
                        "RST_STREAM ack during established stream",
                    ));
                }
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TunnelError> {
        if let Err(e) = self.transport.read_exact(buf).await {
            self.mark_unusable();
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(TunnelError::ShortRead);
            }
            return Err(TunnelError::Io(e));
        }
        Ok(())
    }

    /// Whether the peer has sent its orderly FIN
    pub fn saw_fin(&self) -> bool {
        self.saw_fin
    }

    /// Frames opened so far on this side
    pub fn frames_received(&self) -> u64 {
        self.cipher.seq()
    }

    pub fn mark_unusable(&self) {
        self.unusable.store(true, Ordering::Release);
    }

    pub fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }
}
