//! Semantic layer on top of the frame codec: one [`ProtocolSession`] couples
//! a framed transport with the session cryptography and speaks in protocol
//! operations instead of raw frames.

use crate::{
    connection::codec::FrameCodec,
    error::ChannelError,
    message::{Frame, FrameKind},
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use sable_crypto::SecureSession;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

/// Byte stream a session can run over. Implemented by `TcpStream` and by the
/// in-memory pipes used in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub(crate) type FramedTransport = Framed<Box<dyn Transport>, FrameCodec>;
pub(crate) type FrameSink = SplitSink<FramedTransport, Frame>;
pub(crate) type FrameStream = SplitStream<FramedTransport>;

/// A framed transport bound to a fresh ephemeral crypto session.
///
/// Used unsplit while handshaking; [`into_parts`](Self::into_parts) hands the
/// halves to the live dispatch machinery afterwards.
pub struct ProtocolSession {
    framed: FramedTransport,
    crypto: SecureSession,
}

impl ProtocolSession {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            framed: Framed::new(Box::new(transport), FrameCodec),
            crypto: SecureSession::generate(),
        }
    }

    /// True once the peer's key exchange has been processed.
    pub fn is_initialized(&self) -> bool {
        self.crypto.is_initialized()
    }

    /// Sends our ephemeral public key to the peer.
    pub async fn send_key_exchange(&mut self) -> Result<(), ChannelError> {
        let blob = self.crypto.public_key_blob().to_vec();
        self.framed
            .send(Frame::new(FrameKind::KeyExchange, blob))
            .await
    }

    pub async fn send_ack(&mut self) -> Result<(), ChannelError> {
        self.framed
            .send(Frame::control(FrameKind::ConnectionAck))
            .await
    }

    pub async fn send_typing(&mut self) -> Result<(), ChannelError> {
        self.framed
            .send(Frame::control(FrameKind::TypingIndicator))
            .await
    }

    pub async fn send_read_receipt(&mut self) -> Result<(), ChannelError> {
        self.framed
            .send(Frame::control(FrameKind::ReadReceipt))
            .await
    }

    /// Seals and sends a chat message. Requires a completed key exchange.
    pub async fn send_message(&mut self, text: &str) -> Result<(), ChannelError> {
        let sealed = self.crypto.encrypt(text)?;
        self.framed
            .send(Frame::new(FrameKind::EncryptedMessage, sealed))
            .await
    }

    /// Receives one frame and applies its protocol meaning: a key exchange
    /// feeds the key agreement, an encrypted message is opened, control kinds
    /// pass through. Unknown kinds are a protocol error.
    pub async fn receive(&mut self) -> Result<(FrameKind, Option<String>), ChannelError> {
        let frame = match self.framed.next().await {
            Some(frame) => frame?,
            None => return Err(ChannelError::ConnectionClosed),
        };
        let kind = FrameKind::parse(frame.kind)?;
        match kind {
            FrameKind::KeyExchange => {
                self.crypto.derive(&frame.payload)?;
                Ok((kind, None))
            }
            FrameKind::EncryptedMessage => {
                let text = self.crypto.decrypt(&frame.payload)?;
                Ok((kind, Some(text)))
            }
            FrameKind::TypingIndicator | FrameKind::ReadReceipt | FrameKind::ConnectionAck => {
                Ok((kind, None))
            }
        }
    }

    /// Splits the transport for the live phase. The crypto session moves out
    /// with the halves so the endpoint can keep sealing and wiping it.
    pub(crate) fn into_parts(self) -> (FrameSink, FrameStream, SecureSession) {
        let (sink, stream) = self.framed.split();
        (sink, stream, self.crypto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn session_pair() -> (ProtocolSession, ProtocolSession) {
        let (left, right) = duplex(64 * 1024);
        (ProtocolSession::new(left), ProtocolSession::new(right))
    }

    #[tokio::test]
    async fn key_exchange_initializes_the_receiver() {
        let (mut alice, mut bob) = session_pair();
        alice.send_key_exchange().await.unwrap();
        assert!(!bob.is_initialized());
        let (kind, text) = bob.receive().await.unwrap();
        assert_eq!(kind, FrameKind::KeyExchange);
        assert!(text.is_none());
        assert!(bob.is_initialized());
    }

    #[tokio::test]
    async fn messages_round_trip_after_mutual_exchange() {
        let (mut alice, mut bob) = session_pair();
        alice.send_key_exchange().await.unwrap();
        bob.receive().await.unwrap();
        bob.send_key_exchange().await.unwrap();
        alice.receive().await.unwrap();

        alice.send_message("whisper").await.unwrap();
        let (kind, text) = bob.receive().await.unwrap();
        assert_eq!(kind, FrameKind::EncryptedMessage);
        assert_eq!(text.as_deref(), Some("whisper"));
    }

    #[tokio::test]
    async fn control_frames_carry_no_text_and_no_state() {
        let (mut alice, mut bob) = session_pair();
        alice.send_ack().await.unwrap();
        alice.send_typing().await.unwrap();
        alice.send_read_receipt().await.unwrap();
        for expected in [
            FrameKind::ConnectionAck,
            FrameKind::TypingIndicator,
            FrameKind::ReadReceipt,
        ] {
            let (kind, text) = bob.receive().await.unwrap();
            assert_eq!(kind, expected);
            assert!(text.is_none());
            assert!(!bob.is_initialized());
        }
    }

    #[tokio::test]
    async fn send_message_before_derive_fails() {
        let (mut alice, _bob) = session_pair();
        assert!(matches!(
            alice.send_message("too early").await,
            Err(ChannelError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn unknown_frame_kind_is_rejected() {
        let (left, right) = duplex(1024);
        let mut framed = Framed::new(left, FrameCodec);
        framed
            .send(Frame {
                kind: 0x2a,
                payload: bytes::Bytes::new(),
            })
            .await
            .unwrap();
        let mut bob = ProtocolSession::new(right);
        assert!(matches!(
            bob.receive().await,
            Err(ChannelError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn peer_hangup_is_connection_closed() {
        let (mut alice, bob) = session_pair();
        drop(bob);
        assert!(matches!(
            alice.receive().await,
            Err(ChannelError::ConnectionClosed)
        ));
    }
}
