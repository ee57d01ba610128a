//! Peer-to-peer transport for an anonymous two-party chat.
//!
//! The stack, bottom up: a SOCKS5 client that tunnels outbound TCP through
//! the local anonymity proxy, a length-prefixed frame codec, a protocol
//! session that binds the codec to an ephemeral encrypted session, and two
//! role-specific endpoints (listener and connector) that drive the handshake,
//! the receive loop, sends and disconnects.
//!
//! What the channel guarantees: confidentiality, integrity and forward
//! secrecy per session. What it does not: peer identity. The key exchange is
//! opportunistic, so a man-in-the-middle on the transport goes undetected;
//! the hidden-service address only proves control of the address itself.

pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod socks;
pub mod types;

pub use connection::codec::MAX_FRAME_PAYLOAD;
pub use connection::endpoint::{EndpointOptions, PeerEndpoint, PeerEvent, Phase};
pub use connection::handshake::Role;
pub use error::ChannelError;
pub use types::{DEFAULT_HIDDEN_SERVICE_PORT, HiddenAddr, MAX_MESSAGE_CHARS, SocksProxy};
