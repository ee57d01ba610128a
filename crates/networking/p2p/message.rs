use crate::error::ChannelError;
use bytes::Bytes;
use std::fmt::Display;

/// Wire identifiers for the framed chat protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Carries the sender's ephemeral public key blob.
    KeyExchange = 0x01,
    /// Carries a sealed chat message.
    EncryptedMessage = 0x02,
    TypingIndicator = 0x03,
    ReadReceipt = 0x04,
    /// Zero-payload handshake acknowledgement.
    ConnectionAck = 0x05,
}

impl FrameKind {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::KeyExchange),
            0x02 => Some(Self::EncryptedMessage),
            0x03 => Some(Self::TypingIndicator),
            0x04 => Some(Self::ReadReceipt),
            0x05 => Some(Self::ConnectionAck),
            _ => None,
        }
    }

    /// Maps a raw kind byte coming off the wire, rejecting unknown codes.
    pub fn parse(code: u8) -> Result<Self, ChannelError> {
        Self::from_code(code)
            .ok_or_else(|| ChannelError::Protocol(format!("unknown frame kind {code:#04x}")))
    }
}

impl Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::KeyExchange => "KeyExchange".fmt(f),
            FrameKind::EncryptedMessage => "EncryptedMessage".fmt(f),
            FrameKind::TypingIndicator => "TypingIndicator".fmt(f),
            FrameKind::ReadReceipt => "ReadReceipt".fmt(f),
            FrameKind::ConnectionAck => "ConnectionAck".fmt(f),
        }
    }
}

/// A single frame as it appears on the wire: kind byte, little-endian length,
/// payload. The kind stays raw here; [`FrameKind::parse`] decides whether the
/// session understands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.code(),
            payload: payload.into(),
        }
    }

    /// A zero-payload control frame.
    pub fn control(kind: FrameKind) -> Self {
        Self::new(kind, Bytes::new())
    }
}
