pub mod codec;
pub mod endpoint;
pub mod handshake;
