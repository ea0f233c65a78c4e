//! Single-shot authenticated encryption for the secure channel.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce per call and the tag kept
//! detached from the ciphertext, so the ciphertext has exactly the length of
//! the plaintext.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::SessionKey;
use crate::{IV_LEN, TAG_LEN};

/// Errors that can occur during AEAD operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AeadError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: tag mismatch")]
    TagMismatch,
}

/// Output of [`seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBox {
    /// Random nonce used for this message.
    pub iv: [u8; IV_LEN],
    /// Detached authentication tag.
    pub tag: [u8; TAG_LEN],
    /// Ciphertext, same length as the plaintext.
    pub ciphertext: Vec<u8>,
}

/// Returns a fresh random AEAD nonce.
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypts `plaintext` under `key`, authenticating `aad` as well.
pub fn seal(key: &SessionKey, aad: &[u8], plaintext: &[u8]) -> Result<SealedBox, AeadError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let iv = random_iv();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
        .map_err(|_| AeadError::EncryptionFailed)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedBox {
        iv,
        tag: tag_bytes,
        ciphertext: buffer,
    })
}

/// Decrypts and authenticates a message produced by [`seal`].
pub fn open(
    key: &SessionKey,
    aad: &[u8],
    iv: &[u8; IV_LEN],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut buffer = ciphertext.to_vec();
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(iv),
        aad,
        &mut buffer,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.zeroize();
            Err(AeadError::TagMismatch)
        }
    }
}
