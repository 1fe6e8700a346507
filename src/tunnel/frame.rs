//! Frame encoding/decoding for the tunnel protocol
//!
//! Frames are shaped like HTTP/2 frames so tunnel traffic blends into
//! ordinary TLS-wrapped HTTP/2:
//!
//! ```text
//! +-----------------------------------------------+
//! |                Length (24, BE)                |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+---------------+
//! |R|             Stream Identifier (31)          |
//! +=+=============================================+
//! |   Sealed payload: ciphertext || nonce || tag  |
//! +-----------------------------------------------+
//! ```
//!
//! `Length` counts plaintext bytes; the sealed region on the wire is
//! `Length + NONCE_LEN + TAG_LEN` bytes. The stream identifier is a fresh
//! random 31-bit value per frame. It carries no protocol meaning and exists
//! only for traffic-shape parity with real HTTP/2.

use super::TunnelError;
use crate::crypto::random_bytes;
use bytes::Bytes;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame types (HTTP/2 numbering)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Data frame
    Data = 0x0,
    /// Stream control frame; FIN or ping depending on flags
    RstStream = 0x7,
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    /// Normal data, or orderly write-side close on RST_STREAM
    Fin = 0x0,
    /// Acknowledgment; RST_STREAM with this flag is a ping
    Ack = 0x1,
}

/// A parsed 9-byte frame header
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Plaintext payload length
    pub length: usize,
    pub frame_type: FrameType,
    pub flags: FrameFlag,
    pub stream_id: u32,
}

impl FrameHeader {
    /// Build a header with a fresh random 31-bit stream identifier
    pub fn new(frame_type: FrameType, flags: FrameFlag, length: usize) -> Self {
        Self {
            length,
            frame_type,
            flags,
            stream_id: random_stream_id(),
        }
    }

    /// Encode to the 9-byte wire representation
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        let len = self.length as u32;
        buf[0] = (len >> 16) as u8;
        buf[1] = (len >> 8) as u8;
        buf[2] = len as u8;
        buf[3] = self.frame_type as u8;
        buf[4] = self.flags as u8;
        buf[5..9].copy_from_slice(&self.stream_id.to_be_bytes());
        buf
    }

    /// Parse a 9-byte wire header, rejecting unknown types and flags
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, TunnelError> {
        let length = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;

        let frame_type = match buf[3] {
            0x0 => FrameType::Data,
            0x7 => FrameType::RstStream,
            _ => {
                return Err(TunnelError::BadHeader {
                    frame_type: buf[3],
                    flags: buf[4],
                })
            }
        };

        let flags = match buf[4] {
            0x0 => FrameFlag::Fin,
            0x1 => FrameFlag::Ack,
            _ => {
                return Err(TunnelError::BadHeader {
                    frame_type: buf[3],
                    flags: buf[4],
                })
            }
        };

        Ok(Self {
            length,
            frame_type,
            flags,
            stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
        })
    }
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    /// Plaintext payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(payload: Bytes) -> Self {
        Self {
            header: FrameHeader::new(FrameType::Data, FrameFlag::Fin, payload.len()),
            payload,
        }
    }

    /// Create a FIN frame (RST_STREAM, normal flag): orderly write-side close
    pub fn fin() -> Self {
        Self {
            header: FrameHeader::new(FrameType::RstStream, FrameFlag::Fin, 4),
            payload: Bytes::from_static(&[0u8; 4]),
        }
    }

    /// Create a ping frame (RST_STREAM, ACK flag) with 4 bytes of content
    pub fn ping(content: [u8; 4]) -> Self {
        Self {
            header: FrameHeader::new(FrameType::RstStream, FrameFlag::Ack, 4),
            payload: Bytes::copy_from_slice(&content),
        }
    }

    /// Is this the handshake acknowledgment?
    pub fn is_ping(&self) -> bool {
        self.header.frame_type == FrameType::RstStream && self.header.flags == FrameFlag::Ack
    }

    /// Is this an orderly write-side close?
    pub fn is_fin(&self) -> bool {
        self.header.frame_type == FrameType::RstStream && self.header.flags == FrameFlag::Fin
    }

    /// Is this a data frame?
    pub fn is_data(&self) -> bool {
        self.header.frame_type == FrameType::Data
    }
}

fn random_stream_id() -> u32 {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf);
    u32::from_be_bytes(buf) & 0x7fff_ffff
}
