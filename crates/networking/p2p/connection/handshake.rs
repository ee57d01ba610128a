//! Mutual-acknowledgement handshake.
//!
//! Both roles exchange key-exchange frames and then a second, zero-payload
//! acknowledgement round. The second round guarantees that *both* sides have
//! finished deriving session keys before either may send encrypted traffic;
//! without it the first sender could race the receiver's key derivation.

use crate::{error::ChannelError, message::FrameKind, protocol::ProtocolSession};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Whole-handshake deadline, covering the first frame through the final ack.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Which side of the rendezvous this endpoint plays. The roles run the same
/// four steps; only the order differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Hidden-service side; accepts the inbound connection and speaks first.
    Listener,
    /// SOCKS side; dials out and answers.
    Connector,
}

/// Drives the full handshake for `role`. The ordering below is fixed by the
/// wire protocol and must not be rearranged:
///
/// - listener:  send KE, receive KE, send ACK, receive ACK
/// - connector: receive KE, send KE, receive ACK, send ACK
///
/// Any wrong frame, key failure, timeout or cancellation is fatal for the
/// connection; the caller tears the session down.
pub(crate) async fn perform(
    role: Role,
    session: &mut ProtocolSession,
    deadline: Duration,
    cancel: &CancellationToken,
) -> Result<(), ChannelError> {
    let exchange = async {
        match role {
            Role::Listener => {
                session.send_key_exchange().await?;
                expect(session.receive().await?.0, FrameKind::KeyExchange)?;
                session.send_ack().await?;
                expect(session.receive().await?.0, FrameKind::ConnectionAck)?;
            }
            Role::Connector => {
                expect(session.receive().await?.0, FrameKind::KeyExchange)?;
                session.send_key_exchange().await?;
                expect(session.receive().await?.0, FrameKind::ConnectionAck)?;
                session.send_ack().await?;
            }
        }
        trace!(?role, "Handshake complete");
        Ok(())
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(ChannelError::Cancelled),
        outcome = tokio::time::timeout(deadline, exchange) => match outcome {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        },
    }
}

fn expect(received: FrameKind, wanted: FrameKind) -> Result<(), ChannelError> {
    if received == wanted {
        Ok(())
    } else {
        Err(ChannelError::Protocol(format!(
            "expected {wanted} during handshake, received {received}"
        )))
    }
}
