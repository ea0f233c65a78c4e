//! Cryptographic building blocks.
//!
//! This module provides:
//! - Identity keys and signatures (Ed25519)
//! - Ephemeral key agreement (X25519) and SHA-256 session key derivation
//! - Single-shot AEAD with detached tags (ChaCha20-Poly1305)
//! - CA-signed certificates
//! - The public key store used to authenticate roster users

pub mod aead;
pub mod certificate;
pub mod ephemeral;
pub mod keystore;
pub mod signing;

pub use aead::{open, seal, AeadError, SealedBox};
pub use certificate::{unix_now, Certificate, CertificateError};
pub use ephemeral::{
    derive_session_key, random_nonce, EphemeralKeyPair, SessionKey, EPHEMERAL_PUBLIC_LEN,
};
pub use keystore::{KeyStore, UserKey};
pub use signing::{
    decode_signing_key_pem, decode_verifying_key_pem, encode_signing_key_pem,
    encode_verifying_key_pem, load_signing_key, load_verifying_key, private_key_path,
    public_key_path, sign_message, verify_signature, SigningError, SigningKeyPair,
    SIGNATURE_LEN,
};
