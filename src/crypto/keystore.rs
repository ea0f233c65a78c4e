//! Directory of pre-provisioned user public keys.
//!
//! Keys are looked up by naming convention: `<dir>/<username>_pubkey.pem`.

use ed25519_dalek::VerifyingKey;
use std::fs;
use std::path::PathBuf;

use crate::crypto::signing::{decode_verifying_key_pem, public_key_path, SigningError};

/// A user's public key in both parsed and serialized form.
#[derive(Debug, Clone)]
pub struct UserKey {
    /// Parsed key used for signature checks.
    pub verifying_key: VerifyingKey,
    /// PEM bytes as stored, forwarded verbatim to chat peers.
    pub pem: Vec<u8>,
}

/// Read-only view of the key directory.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// Opens a key store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Loads the public key registered for `username`.
    pub fn load(&self, username: &str) -> Result<UserKey, SigningError> {
        let pem = fs::read_to_string(public_key_path(&self.dir, username))?;
        let verifying_key = decode_verifying_key_pem(&pem)?;
        Ok(UserKey {
            verifying_key,
            pem: pem.into_bytes(),
        })
    }
}
