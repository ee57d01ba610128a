use sable_crypto::CryptoError;

/// Everything that can go wrong on a peer channel, from the SOCKS dial up to
/// the live session. All variants except [`NotConnected`](Self::NotConnected)
/// are fatal for the connection they occur on.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("SOCKS5 proxy refused the no-auth method")]
    SocksNegotiation,
    #[error("SOCKS5 connect rejected with reply code {0:#04x}")]
    SocksConnect(u8),
    #[error("malformed SOCKS5 exchange")]
    SocksProtocol,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("no live session")]
    NotConnected,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
