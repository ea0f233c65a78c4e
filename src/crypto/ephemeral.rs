//! Ephemeral key agreement (X25519) and session key derivation.

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KEY_LEN, NONCE_LEN};

/// X25519 public key length.
pub const EPHEMERAL_PUBLIC_LEN: usize = 32;

/// Symmetric key protecting one connection. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Ephemeral X25519 key pair used for exactly one handshake.
///
/// The secret half is consumed by [`EphemeralKeyPair::agree`] so it cannot be
/// reused.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generates a fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, as sent on the wire.
    pub fn public_bytes(&self) -> [u8; EPHEMERAL_PUBLIC_LEN] {
        self.public.to_bytes()
    }

    /// Performs the key agreement and hashes the raw secret into a session key.
    pub fn agree(self, peer_public: &[u8; EPHEMERAL_PUBLIC_LEN]) -> SessionKey {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        derive_session_key(shared.as_bytes())
    }
}

/// `SHA-256(shared_secret)`.
pub fn derive_session_key(shared_secret: &[u8]) -> SessionKey {
    let digest = Sha256::digest(shared_secret);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest);
    SessionKey(key)
}

/// Fresh handshake nonce (R1 / R2).
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
