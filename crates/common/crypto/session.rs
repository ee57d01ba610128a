use crate::CryptoError;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hmac::{Hmac, Mac};
use p256::{PublicKey, ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Uncompressed SEC1 point, the exact blob carried by a key-exchange frame.
pub const PUBLIC_KEY_BLOB_LEN: usize = 65;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
/// IV plus tag; every sealed message is at least this long.
pub const SEALED_OVERHEAD: usize = IV_LEN + TAG_LEN;

/// Subkeys split out of `SHA-512(shared_secret)`. Scrubbed on drop so an
/// abandoned session cannot leak key material through freed memory.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SessionKeys {
    aes: [u8; 32],
    mac: [u8; 32],
}

/// One side of an ephemeral encrypted session.
///
/// The life cycle is fixed: [`generate`](Self::generate), exchange public key
/// blobs with the peer, [`derive`](Self::derive) exactly once, then
/// [`encrypt`](Self::encrypt)/[`decrypt`](Self::decrypt) until
/// [`wipe`](Self::wipe).
pub struct SecureSession {
    /// Consumed by the key agreement; `None` afterwards.
    ephemeral: Option<EphemeralSecret>,
    public_blob: Vec<u8>,
    keys: Option<SessionKeys>,
}

impl SecureSession {
    /// Generates a fresh P-256 key pair for this session.
    pub fn generate() -> Self {
        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let public_blob = ephemeral
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Self {
            ephemeral: Some(ephemeral),
            public_blob,
            keys: None,
        }
    }

    /// The local public key in the form [`derive`](Self::derive) consumes.
    pub fn public_key_blob(&self) -> &[u8] {
        &self.public_blob
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.is_some()
    }

    /// Runs the key agreement against the peer's public key blob and splits
    /// `SHA-512(shared_secret)` into the AES and MAC subkeys.
    ///
    /// Callable at most once; the ephemeral secret is consumed here.
    pub fn derive(&mut self, peer_public_key_blob: &[u8]) -> Result<(), CryptoError> {
        if self.keys.is_some() {
            return Err(CryptoError::AlreadyInitialized);
        }
        let peer_key =
            PublicKey::from_sec1_bytes(peer_public_key_blob).map_err(|_| CryptoError::BadPeerKey)?;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or(CryptoError::AlreadyInitialized)?;
        let shared_secret = ephemeral.diffie_hellman(&peer_key);

        let mut digest = Sha512::digest(shared_secret.raw_secret_bytes());
        let mut keys = SessionKeys {
            aes: [0; 32],
            mac: [0; 32],
        };
        keys.aes.copy_from_slice(&digest[..32]);
        keys.mac.copy_from_slice(&digest[32..]);
        digest.as_mut_slice().zeroize();
        self.keys = Some(keys);
        Ok(())
    }

    /// Seals a message as `IV || AES-256-CBC ciphertext || HMAC-SHA256 tag`
    /// with a fresh random IV. The tag covers `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::NotInitialized)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new((&keys.aes).into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut sealed = Vec::with_capacity(SEALED_OVERHEAD + ciphertext.len());
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);
        sealed.extend_from_slice(&tag(keys, &iv, &ciphertext));
        Ok(sealed)
    }

    /// Opens a sealed message. The tag is verified in constant time before
    /// any block-cipher work; a mismatch never yields partial plaintext.
    pub fn decrypt(&self, sealed: &[u8]) -> Result<String, CryptoError> {
        let keys = self.keys.as_ref().ok_or(CryptoError::NotInitialized)?;
        if sealed.len() < SEALED_OVERHEAD {
            return Err(CryptoError::MalformedCiphertext);
        }
        let (iv, rest) = sealed.split_at(IV_LEN);
        let (ciphertext, received_tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut mac = HmacSha256::new_from_slice(&keys.mac).expect("HMAC accepts any key length");
        mac.update(iv);
        mac.update(ciphertext);
        mac.verify_slice(received_tag)
            .map_err(|_| CryptoError::IntegrityFailed)?;

        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
            return Err(CryptoError::MalformedCiphertext);
        }
        let iv_bytes: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::MalformedCiphertext)?;
        let plaintext = Aes256CbcDec::new((&keys.aes).into(), (&iv_bytes).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::MalformedCiphertext)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::MalformedCiphertext)
    }

    /// Scrubs all key material. The session is unusable afterwards.
    pub fn wipe(&mut self) {
        self.ephemeral = None;
        self.keys = None;
    }
}

impl std::fmt::Debug for SecureSession {
    // Key material must never end up in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

fn tag(keys: &SessionKeys, iv: &[u8], ciphertext: &[u8]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(&keys.mac).expect("HMAC accepts any key length");
    mac.update(iv);
    mac.update(ciphertext);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn session_with_keys(material: &[u8; 64]) -> SecureSession {
        let mut keys = SessionKeys {
            aes: [0; 32],
            mac: [0; 32],
        };
        keys.aes.copy_from_slice(&material[..32]);
        keys.mac.copy_from_slice(&material[32..]);
        SecureSession {
            ephemeral: None,
            public_blob: Vec::new(),
            keys: Some(keys),
        }
    }

    fn paired_sessions() -> (SecureSession, SecureSession) {
        let mut alice = SecureSession::generate();
        let mut bob = SecureSession::generate();
        let alice_blob = alice.public_key_blob().to_vec();
        let bob_blob = bob.public_key_blob().to_vec();
        alice.derive(&bob_blob).unwrap();
        bob.derive(&alice_blob).unwrap();
        (alice, bob)
    }

    #[test]
    fn public_key_blob_is_uncompressed_sec1() {
        let session = SecureSession::generate();
        let blob = session.public_key_blob();
        assert_eq!(blob.len(), PUBLIC_KEY_BLOB_LEN);
        assert_eq!(blob[0], 0x04);
    }

    #[test]
    fn round_trips_in_both_directions() {
        let (alice, bob) = paired_sessions();
        let sealed = alice.encrypt("hello over the onion").unwrap();
        assert_eq!(bob.decrypt(&sealed).unwrap(), "hello over the onion");
        let sealed = bob.encrypt("çatlak ütücü 你好").unwrap();
        assert_eq!(alice.decrypt(&sealed).unwrap(), "çatlak ütücü 你好");
    }

    #[test]
    fn empty_plaintext_seals_to_exactly_64_bytes() {
        let (alice, bob) = paired_sessions();
        let sealed = alice.encrypt("").unwrap();
        assert_eq!(sealed.len(), SEALED_OVERHEAD + 16);
        assert_eq!(bob.decrypt(&sealed).unwrap(), "");
    }

    #[test]
    fn max_chat_message_round_trips() {
        let (alice, bob) = paired_sessions();
        let message: String = "λ".repeat(280);
        assert_eq!(message.chars().count(), 280);
        let sealed = alice.encrypt(&message).unwrap();
        assert_eq!(bob.decrypt(&sealed).unwrap(), message);
    }

    #[test]
    fn any_single_byte_flip_is_rejected() {
        let (alice, bob) = paired_sessions();
        let sealed = alice.encrypt("secret").unwrap();
        // Cover the IV, ciphertext and tag regions.
        for index in [0, 8, IV_LEN, IV_LEN + 5, sealed.len() - TAG_LEN, sealed.len() - 1] {
            let mut tampered = sealed.clone();
            tampered[index] ^= 0x01;
            assert_eq!(
                bob.decrypt(&tampered),
                Err(CryptoError::IntegrityFailed),
                "flip at offset {index} must not decrypt"
            );
        }
    }

    #[test]
    fn truncated_input_is_malformed() {
        let (alice, bob) = paired_sessions();
        let sealed = alice.encrypt("secret").unwrap();
        assert_eq!(
            bob.decrypt(&sealed[..SEALED_OVERHEAD - 1]),
            Err(CryptoError::MalformedCiphertext)
        );
    }

    #[test]
    fn fresh_sessions_derive_distinct_keys() {
        let (alice, _) = paired_sessions();
        let (carol, _) = paired_sessions();
        let keys_a = alice.keys.as_ref().unwrap();
        let keys_c = carol.keys.as_ref().unwrap();
        assert_ne!(keys_a.aes, keys_c.aes);
        assert_ne!(keys_a.mac, keys_c.mac);
    }

    #[test]
    fn peers_derive_the_same_keys() {
        let (alice, bob) = paired_sessions();
        let keys_a = alice.keys.as_ref().unwrap();
        let keys_b = bob.keys.as_ref().unwrap();
        assert_eq!(keys_a.aes, keys_b.aes);
        assert_eq!(keys_a.mac, keys_b.mac);
        assert_ne!(keys_a.aes, keys_a.mac);
    }

    #[test]
    fn use_before_derive_fails() {
        let session = SecureSession::generate();
        assert_eq!(session.encrypt("hi"), Err(CryptoError::NotInitialized));
        assert_eq!(session.decrypt(&[0; 64]), Err(CryptoError::NotInitialized));
    }

    #[test]
    fn derive_twice_fails() {
        let (mut alice, _) = paired_sessions();
        let other = SecureSession::generate();
        let blob = other.public_key_blob().to_vec();
        assert_eq!(alice.derive(&blob), Err(CryptoError::AlreadyInitialized));
    }

    #[test]
    fn malformed_peer_key_is_rejected() {
        let mut session = SecureSession::generate();
        assert_eq!(session.derive(&[]), Err(CryptoError::BadPeerKey));
        assert_eq!(session.derive(&[0x04; 65]), Err(CryptoError::BadPeerKey));
        // Correct length and prefix, but not a point on the curve.
        let mut blob = [0xabu8; 65];
        blob[0] = 0x04;
        assert_eq!(session.derive(&blob), Err(CryptoError::BadPeerKey));
    }

    #[test]
    fn sealing_depends_only_on_the_derived_keys() {
        let material = hex!(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            "202122232425262728292a2b2c2d2e2f303132333435363738393a3b3c3d3e3f"
        );
        let sender = session_with_keys(&material);
        let receiver = session_with_keys(&material);
        let sealed = sender.encrypt("fixed-key round trip").unwrap();
        assert_eq!(receiver.decrypt(&sealed).unwrap(), "fixed-key round trip");

        let mut skewed = material;
        skewed[63] ^= 0x01;
        let stranger = session_with_keys(&skewed);
        assert_eq!(stranger.decrypt(&sealed), Err(CryptoError::IntegrityFailed));
    }

    #[test]
    fn wipe_discards_key_material() {
        let (mut alice, _) = paired_sessions();
        alice.wipe();
        assert!(!alice.is_initialized());
        assert_eq!(alice.encrypt("hi"), Err(CryptoError::NotInitialized));
    }

    #[test]
    fn session_keys_zeroize_in_place() {
        let mut keys = SessionKeys {
            aes: [0xaa; 32],
            mac: [0xbb; 32],
        };
        keys.zeroize();
        assert_eq!(keys.aes, [0; 32]);
        assert_eq!(keys.mac, [0; 32]);
    }
}
