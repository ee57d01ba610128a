//! Ephemeral session cryptography for the sable chat transport.
//!
//! A [`SecureSession`] pairs an ephemeral P-256 ECDH key agreement with
//! AES-256-CBC + HMAC-SHA256 Encrypt-then-MAC sealing. Every session gets a
//! fresh key pair, so compromise of one session never exposes another.
//!
//! The exchange is opportunistic: it provides confidentiality and integrity
//! for the session, **not** peer identity. An attacker who controls the
//! transport can man-in-the-middle the key agreement. Callers that need
//! identity binding must layer it on top (e.g. by signing the key exchange
//! with a long-term key).

mod session;

pub use session::{SecureSession, PUBLIC_KEY_BLOB_LEN, SEALED_OVERHEAD};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("peer public key is malformed or not on the curve")]
    BadPeerKey,
    #[error("session keys have not been derived")]
    NotInitialized,
    #[error("session keys were already derived")]
    AlreadyInitialized,
    #[error("message authentication failed")]
    IntegrityFailed,
    #[error("ciphertext is malformed")]
    MalformedCiphertext,
}
