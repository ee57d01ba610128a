//! Role-specific chat endpoints.
//!
//! A [`PeerEndpoint`] owns at most one live session at a time. The listener
//! role accepts inbound connections on a loopback port (the tunnel daemon
//! forwards hidden-service traffic there) and replaces the previous session
//! whenever a new connection arrives. The connector role dials the peer's
//! hidden address through the local SOCKS5 proxy.
//!
//! Inbound traffic surfaces through a bounded [`PeerEvent`] channel in
//! frame-arrival order.

use crate::{
    connection::handshake::{self, HANDSHAKE_TIMEOUT, Role},
    error::ChannelError,
    message::{Frame, FrameKind},
    protocol::{FrameSink, FrameStream, ProtocolSession, Transport},
    socks::{self, DEFAULT_IO_TIMEOUT},
    types::{HiddenAddr, SocksProxy},
};
use futures::{SinkExt, StreamExt};
use sable_crypto::SecureSession;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{Mutex, mpsc},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Events surfaced to the embedding application, in frame-arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// An inbound connection was accepted, or an outbound dial started.
    Connecting,
    /// The mutual-ack handshake completed; the session is live.
    Connected,
    /// The live session ended unexpectedly or the peer closed it. Never
    /// emitted for a local `stop` or cancellation.
    Disconnected,
    /// An authenticated chat message arrived.
    Message(String),
    TypingIndicator,
    ReadReceipt,
}

/// Endpoint life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dialing,
    Handshaking,
    Live,
    Closing,
    Closed,
}

/// Tunable deadlines and buffer sizes; the defaults are the protocol's.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    pub handshake_timeout: Duration,
    pub socks_io_timeout: Duration,
    pub event_buffer: usize,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            socks_io_timeout: DEFAULT_IO_TIMEOUT,
            event_buffer: 32,
        }
    }
}

/// State of one established session. The sink mutex serializes whole frames;
/// concurrent senders can never interleave bytes on the wire.
struct LiveSession {
    sink: Mutex<FrameSink>,
    crypto: StdMutex<SecureSession>,
    /// Child of the endpoint token; cancelling it stops only this session's
    /// dispatch task.
    cancel: CancellationToken,
}

struct EndpointShared {
    role: Role,
    phase: StdMutex<Phase>,
    current: StdMutex<Option<Arc<LiveSession>>>,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
}

impl EndpointShared {
    fn new(
        role: Role,
        options: &EndpointOptions,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events, events_rx) = mpsc::channel(options.event_buffer);
        let shared = Arc::new(Self {
            role,
            phase: StdMutex::new(Phase::Idle),
            current: StdMutex::new(None),
            events,
            cancel,
        });
        (shared, events_rx)
    }

    fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    async fn emit(&self, event: PeerEvent) {
        // The application dropping its receiver is its own choice to stop
        // listening; it never brings the session down.
        let _ = self.events.send(event).await;
    }

    /// Closes the current session, if any, without emitting `Disconnected`.
    /// The session is removed from `current` before its task is woken, so the
    /// stale dispatch task finds itself disowned and exits silently.
    fn teardown_current(&self) {
        let previous = lock(&self.current).take();
        if let Some(session) = previous {
            lock(&session.crypto).wipe();
            session.cancel.cancel();
        }
    }
}

/// One endpoint of the two-party chat channel.
///
/// The session is confidential and integrity-protected, but the key exchange
/// is opportunistic: nothing binds the peer's key to an identity. Treat the
/// channel as anonymous, not authenticated.
pub struct PeerEndpoint {
    shared: Arc<EndpointShared>,
    local_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEndpoint")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl PeerEndpoint {
    /// Starts the hidden-service side: binds `127.0.0.1:listen_port` and
    /// accepts connections until cancelled. Each new inbound connection
    /// replaces the previous session; a failed handshake only costs that
    /// connection, the accept loop keeps going.
    pub async fn listen(
        listen_port: u16,
        options: EndpointOptions,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), ChannelError> {
        let listener = TcpListener::bind(("127.0.0.1", listen_port)).await?;
        let local_addr = listener.local_addr()?;
        let (shared, events_rx) = EndpointShared::new(Role::Listener, &options, cancel);
        info!(%local_addr, "Chat endpoint listening");
        tokio::spawn(accept_loop(shared.clone(), listener, options));
        Ok((
            Self {
                shared,
                local_addr: Some(local_addr),
            },
            events_rx,
        ))
    }

    /// Starts the outbound side: dials `target:target_port` through the local
    /// SOCKS5 proxy and runs the connector handshake. Errors are returned to
    /// the caller; no `Disconnected` event is emitted for a failed dial.
    pub async fn connect(
        proxy: SocksProxy,
        target: &HiddenAddr,
        target_port: u16,
        options: EndpointOptions,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), ChannelError> {
        let (shared, events_rx) = EndpointShared::new(Role::Connector, &options, cancel);
        shared.emit(PeerEvent::Connecting).await;
        shared.set_phase(Phase::Dialing);
        let dialed = tokio::select! {
            _ = shared.cancel.cancelled() => Err(ChannelError::Cancelled),
            dialed = socks::dial(proxy, target, target_port, options.socks_io_timeout) => dialed,
        };
        let stream = match dialed {
            Ok(stream) => stream,
            Err(error) => {
                shared.set_phase(Phase::Closed);
                return Err(error);
            }
        };
        Self::finish_connect(shared, events_rx, stream, &options).await
    }

    /// Connector variant for callers that already hold a duplex stream to the
    /// peer (tests, embedders with their own transport). SOCKS is bypassed;
    /// the handshake and live session behave identically.
    pub async fn connect_stream(
        stream: impl Transport + 'static,
        options: EndpointOptions,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), ChannelError> {
        let (shared, events_rx) = EndpointShared::new(Role::Connector, &options, cancel);
        shared.emit(PeerEvent::Connecting).await;
        Self::finish_connect(shared, events_rx, stream, &options).await
    }

    async fn finish_connect(
        shared: Arc<EndpointShared>,
        events_rx: mpsc::Receiver<PeerEvent>,
        stream: impl Transport + 'static,
        options: &EndpointOptions,
    ) -> Result<(Self, mpsc::Receiver<PeerEvent>), ChannelError> {
        shared.set_phase(Phase::Handshaking);
        let mut session = ProtocolSession::new(stream);
        match handshake::perform(
            Role::Connector,
            &mut session,
            options.handshake_timeout,
            &shared.cancel,
        )
        .await
        {
            Ok(()) => {
                install_live(&shared, session).await;
                Ok((
                    Self {
                        shared,
                        local_addr: None,
                    },
                    events_rx,
                ))
            }
            Err(error) => {
                // Dropping the session scrubs its key material.
                shared.set_phase(Phase::Closed);
                Err(error)
            }
        }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Bound address of the accept socket; listener role only.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Seals and sends a chat message on the live session.
    pub async fn send_message(&self, text: &str) -> Result<(), ChannelError> {
        let session = self.live_session()?;
        let sealed = lock(&session.crypto).encrypt(text)?;
        send_frame(&session, Frame::new(FrameKind::EncryptedMessage, sealed)).await
    }

    pub async fn send_typing(&self) -> Result<(), ChannelError> {
        let session = self.live_session()?;
        send_frame(&session, Frame::control(FrameKind::TypingIndicator)).await
    }

    pub async fn send_read_receipt(&self) -> Result<(), ChannelError> {
        let session = self.live_session()?;
        send_frame(&session, Frame::control(FrameKind::ReadReceipt)).await
    }

    /// Cooperative local shutdown: stops background tasks, closes the live
    /// session and scrubs its key material. Emits no `Disconnected`.
    pub fn stop(&self) {
        self.shared.set_phase(Phase::Closing);
        self.shared.cancel.cancel();
        self.shared.teardown_current();
        self.shared.set_phase(Phase::Closed);
    }

    fn live_session(&self) -> Result<Arc<LiveSession>, ChannelError> {
        if self.shared.phase() != Phase::Live {
            return Err(ChannelError::NotConnected);
        }
        lock(&self.shared.current)
            .clone()
            .ok_or(ChannelError::NotConnected)
    }
}

async fn accept_loop(shared: Arc<EndpointShared>, listener: TcpListener, options: EndpointOptions) {
    loop {
        let accepted = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(pair) => pair,
            Err(error) => {
                warn!(%error, "Failed to accept inbound connection");
                continue;
            }
        };
        debug!(%peer_addr, "Inbound connection");
        shared.emit(PeerEvent::Connecting).await;
        // At most one live session: close the previous one before the
        // replacement handshakes.
        shared.teardown_current();
        shared.set_phase(Phase::Handshaking);

        let mut session = ProtocolSession::new(stream);
        match handshake::perform(
            Role::Listener,
            &mut session,
            options.handshake_timeout,
            &shared.cancel,
        )
        .await
        {
            Ok(()) => install_live(&shared, session).await,
            Err(error) => {
                debug!(%peer_addr, %error, "Handshake failed; awaiting a new connection");
                shared.set_phase(Phase::Idle);
            }
        }
    }
    shared.teardown_current();
    shared.set_phase(Phase::Closed);
}

/// Promotes a handshaken session to live: installs it as the endpoint's
/// current session, announces `Connected` and starts the dispatch task.
async fn install_live(shared: &Arc<EndpointShared>, session: ProtocolSession) {
    let (sink, stream, crypto) = session.into_parts();
    let live = Arc::new(LiveSession {
        sink: Mutex::new(sink),
        crypto: StdMutex::new(crypto),
        cancel: shared.cancel.child_token(),
    });
    lock(&shared.current).replace(live.clone());
    shared.set_phase(Phase::Live);
    shared.emit(PeerEvent::Connected).await;
    tokio::spawn(dispatch(shared.clone(), live, stream));
}

enum Teardown {
    Cancelled,
    PeerClosed,
    Failed(ChannelError),
}

/// Per-session receive loop. Exactly one of these runs per live session; it
/// owns the stream half until the session ends.
async fn dispatch(shared: Arc<EndpointShared>, live: Arc<LiveSession>, mut frames: FrameStream) {
    let outcome = loop {
        let next = tokio::select! {
            _ = live.cancel.cancelled() => break Teardown::Cancelled,
            next = frames.next() => next,
        };
        let frame = match next {
            None => break Teardown::PeerClosed,
            Some(Err(error)) => break Teardown::Failed(error),
            Some(Ok(frame)) => frame,
        };
        if let Err(error) = handle_frame(&shared, &live, frame).await {
            break Teardown::Failed(error);
        }
    };
    finish_dispatch(shared, live, outcome).await;
}

async fn handle_frame(
    shared: &EndpointShared,
    live: &LiveSession,
    frame: Frame,
) -> Result<(), ChannelError> {
    match FrameKind::parse(frame.kind)? {
        FrameKind::EncryptedMessage => {
            let text = lock(&live.crypto).decrypt(&frame.payload)?;
            trace!("Received chat message");
            shared.emit(PeerEvent::Message(text)).await;
            // Acknowledge delivery so the sender can mark the message seen.
            send_frame(live, Frame::control(FrameKind::ReadReceipt)).await
        }
        FrameKind::TypingIndicator => {
            shared.emit(PeerEvent::TypingIndicator).await;
            Ok(())
        }
        FrameKind::ReadReceipt => {
            shared.emit(PeerEvent::ReadReceipt).await;
            Ok(())
        }
        kind @ (FrameKind::KeyExchange | FrameKind::ConnectionAck) => Err(ChannelError::Protocol(
            format!("unexpected {kind} frame on a live session"),
        )),
    }
}

/// Final accounting for a dispatch task. A stale task whose session was
/// already replaced must stay silent: only the task that still owns the
/// endpoint's current session may report a disconnect.
async fn finish_dispatch(shared: Arc<EndpointShared>, live: Arc<LiveSession>, outcome: Teardown) {
    let owns_current = {
        let mut current = lock(&shared.current);
        if current
            .as_ref()
            .is_some_and(|session| Arc::ptr_eq(session, &live))
        {
            current.take();
            true
        } else {
            false
        }
    };
    lock(&live.crypto).wipe();
    live.cancel.cancel();
    if !owns_current {
        trace!("Replaced session dispatch exited");
        return;
    }

    match outcome {
        Teardown::Cancelled => {
            // Local shutdown; the application asked for it, no event.
            shared.set_phase(Phase::Closed);
        }
        Teardown::PeerClosed => {
            debug!("Peer closed the connection");
            announce_disconnect(&shared).await;
        }
        Teardown::Failed(error) => {
            debug!(%error, "Session failed");
            announce_disconnect(&shared).await;
        }
    }
}

async fn announce_disconnect(shared: &EndpointShared) {
    // A listener goes back to waiting for the next inbound connection.
    shared.set_phase(match shared.role {
        Role::Listener => Phase::Idle,
        Role::Connector => Phase::Closed,
    });
    shared.emit(PeerEvent::Disconnected).await;
}

async fn send_frame(session: &LiveSession, frame: Frame) -> Result<(), ChannelError> {
    let mut sink = session.sink.lock().await;
    sink.send(frame).await
}

// The guarded values are plain state; a lock poisoned by a panicking holder
// is still safe to recover.
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
