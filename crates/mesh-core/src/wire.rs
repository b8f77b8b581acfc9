//! Mesh wire format — framing for every byte that crosses a socket.
//!
//! Both rendezvous control connections and peer mesh connections carry a
//! sequence of frames. A frame is a fixed 5-byte header followed by exactly
//! `length` payload bytes. The header says what the payload is, so control
//! tokens never share a byte stream position with raw file data.
//!
//! Changing anything in `FrameHeader` or `FrameKind` is a breaking change for
//! every deployed node.

use bytes::{Buf, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use tokio_util::codec::{Decoder, Encoder};
use zerocopy::byteorder::{NetworkEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::protocol::{Command, TransferToken};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Precedes every frame payload.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// One of the `FrameKind` discriminants.
    pub kind: u8,

    /// Payload length in bytes, not including this header. Big-endian.
    pub length: U32<NetworkEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 5]);

/// Size of `FrameHeader` on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Largest payload a single frame may carry.
/// File payloads are split far below this; the cap only bounds what a
/// misbehaving peer can make us buffer.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

// ── Frame Kind ───────────────────────────────────────────────────────────────

/// What a frame's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Mesh handshake: the dialer's listening port as a decimal string.
    Hello = 0x01,
    /// Rendezvous command text, e.g. `register:host:port`.
    Command = 0x02,
    /// Rendezvous reply text, e.g. the `request_nodes` peer list.
    Reply = 0x03,
    /// Gossip envelope.
    Gossip = 0x04,
    /// Transfer control token, e.g. `check_ready`.
    Control = 0x05,
    /// One chunk of transfer payload. Opaque bytes.
    Data = 0x06,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::Command),
            0x03 => Ok(FrameKind::Reply),
            0x04 => Ok(FrameKind::Gossip),
            0x05 => Ok(FrameKind::Control),
            0x06 => Ok(FrameKind::Data),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn hello(listen_port: u16) -> Self {
        Self::new(FrameKind::Hello, listen_port.to_string())
    }

    pub fn command(command: &Command) -> Self {
        Self::new(FrameKind::Command, command.to_string())
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Reply, text.into())
    }

    pub fn gossip(envelope: Vec<u8>) -> Self {
        Self::new(FrameKind::Gossip, envelope)
    }

    pub fn control(token: &TransferToken) -> Self {
        Self::new(FrameKind::Control, token.to_string())
    }

    pub fn data(chunk: Bytes) -> Self {
        Self::new(FrameKind::Data, chunk)
    }

    /// Payload as UTF-8. Every kind except `Data` carries text.
    pub fn text(&self) -> Result<&str, WireError> {
        std::str::from_utf8(&self.payload).map_err(|_| WireError::NotUtf8(self.kind))
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

/// `tokio_util` codec for `Frame`s. Stateless; one per socket half.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        let Some(header) = FrameHeader::read_from_prefix(&src[..]) else {
            return Ok(None);
        };

        let kind = FrameKind::try_from(header.kind)?;
        let length = header.length.get() as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame { kind, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let length = frame.payload.len();
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }

        let header = FrameHeader {
            kind: frame.kind.into(),
            length: U32::new(length as u32),
        };
        dst.reserve(HEADER_LEN + length);
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("{0:?} frame payload is not valid UTF-8")]
    NotUtf8(FrameKind),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
