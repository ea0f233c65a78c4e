//! Minimal CA-signed identity certificates.
//!
//! A certificate binds a subject name to an Ed25519 public key for a validity
//! window, signed by a certificate authority key. The server presents its
//! certificate in handshake message M2; clients trust a single CA key.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::crypto::signing::{armor, extract_pem_content, verify_signature, SigningError};
use crate::crypto::SigningKeyPair;

const CERTIFICATE_HEADER: &str = "-----BEGIN SECURECHAT CERTIFICATE-----";
const CERTIFICATE_FOOTER: &str = "-----END SECURECHAT CERTIFICATE-----";

/// Certificate format version.
pub const CERTIFICATE_VERSION: u8 = 1;

/// Errors that can occur while handling certificates.
#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Malformed certificate: {0}")]
    Malformed(String),

    #[error("Unsupported certificate version: {0}")]
    UnsupportedVersion(u8),

    #[error("Certificate signature is invalid")]
    BadSignature,

    #[error("Certificate subject mismatch: expected {expected}, got {got}")]
    SubjectMismatch { expected: String, got: String },

    #[error("Certificate not valid at {now} (valid {not_before}..{not_after})")]
    Expired {
        now: u64,
        not_before: u64,
        not_after: u64,
    },

    #[error("Certificate key is invalid")]
    InvalidKey,

    #[error("PEM error: {0}")]
    Pem(#[from] SigningError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The signed portion of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TbsCertificate {
    version: u8,
    subject: String,
    issuer: String,
    subject_key: [u8; 32],
    not_before: u64,
    not_after: u64,
}

/// A CA-signed binding between a name and an Ed25519 key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    tbs: TbsCertificate,
    signature: Vec<u8>,
}

impl Certificate {
    /// Issues a certificate for `subject_key`, valid from now for `valid_for_secs`.
    pub fn issue(
        subject: &str,
        subject_key: &VerifyingKey,
        issuer: &str,
        issuer_keys: &SigningKeyPair,
        valid_for_secs: u64,
    ) -> Result<Self, CertificateError> {
        let now = unix_now();
        let tbs = TbsCertificate {
            version: CERTIFICATE_VERSION,
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            subject_key: subject_key.to_bytes(),
            not_before: now,
            not_after: now.saturating_add(valid_for_secs),
        };
        let signature = issuer_keys.sign(&tbs_bytes(&tbs)?);
        Ok(Self { tbs, signature })
    }

    /// Subject name.
    pub fn subject(&self) -> &str {
        &self.tbs.subject
    }

    /// Issuer name.
    pub fn issuer(&self) -> &str {
        &self.tbs.issuer
    }

    /// Certified public key.
    pub fn subject_key(&self) -> Result<VerifyingKey, CertificateError> {
        VerifyingKey::from_bytes(&self.tbs.subject_key).map_err(|_| CertificateError::InvalidKey)
    }

    /// Checks the CA signature and the validity window at `now`.
    pub fn verify(&self, ca_key: &VerifyingKey, now: u64) -> Result<(), CertificateError> {
        if self.tbs.version != CERTIFICATE_VERSION {
            return Err(CertificateError::UnsupportedVersion(self.tbs.version));
        }
        verify_signature(&tbs_bytes(&self.tbs)?, &self.signature, ca_key)
            .map_err(|_| CertificateError::BadSignature)?;
        if now < self.tbs.not_before || now > self.tbs.not_after {
            return Err(CertificateError::Expired {
                now,
                not_before: self.tbs.not_before,
                not_after: self.tbs.not_after,
            });
        }
        Ok(())
    }

    /// Verifies the certificate and that it names `expected_subject`, returning its key.
    pub fn verify_for(
        &self,
        ca_key: &VerifyingKey,
        expected_subject: &str,
    ) -> Result<VerifyingKey, CertificateError> {
        self.verify(ca_key, unix_now())?;
        if self.tbs.subject != expected_subject {
            return Err(CertificateError::SubjectMismatch {
                expected: expected_subject.to_string(),
                got: self.tbs.subject.clone(),
            });
        }
        self.subject_key()
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CertificateError> {
        bincode::serialize(self).map_err(|e| CertificateError::Malformed(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CertificateError> {
        bincode::deserialize(bytes).map_err(|e| CertificateError::Malformed(e.to_string()))
    }

    /// PEM armored form.
    pub fn to_pem(&self) -> Result<String, CertificateError> {
        Ok(armor(
            CERTIFICATE_HEADER,
            &BASE64.encode(self.to_bytes()?),
            CERTIFICATE_FOOTER,
        ))
    }

    /// Parses the PEM armored form.
    pub fn from_pem(pem: &str) -> Result<Self, CertificateError> {
        let content = extract_pem_content(pem, CERTIFICATE_HEADER, CERTIFICATE_FOOTER)?;
        let bytes = BASE64
            .decode(content)
            .map_err(|e| CertificateError::Malformed(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Writes the certificate as PEM.
    pub fn save(&self, path: &Path) -> Result<(), CertificateError> {
        fs::write(path, self.to_pem()?)?;
        Ok(())
    }

    /// Reads a PEM certificate from disk.
    pub fn load(path: &Path) -> Result<Self, CertificateError> {
        Self::from_pem(&fs::read_to_string(path)?)
    }
}

fn tbs_bytes(tbs: &TbsCertificate) -> Result<Vec<u8>, CertificateError> {
    bincode::serialize(tbs).map_err(|e| CertificateError::Malformed(e.to_string()))
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue_server_cert(ca: &SigningKeyPair) -> (SigningKeyPair, Certificate) {
        let server = SigningKeyPair::generate();
        let cert = Certificate::issue("server", server.verifying_key(), "ca", ca, 3600).unwrap();
        (server, cert)
    }

    #[test]
    fn test_issue_and_verify() {
        let ca = SigningKeyPair::generate();
        let (server, cert) = issue_server_cert(&ca);

        let key = cert.verify_for(ca.verifying_key(), "server").unwrap();
        assert_eq!(key.as_bytes(), server.verifying_key().as_bytes());
        assert_eq!(cert.issuer(), "ca");
    }

    #[test]
    fn test_wrong_ca_rejected() {
        let ca = SigningKeyPair::generate();
        let rogue = SigningKeyPair::generate();
        let (_, cert) = issue_server_cert(&ca);

        assert!(matches!(
            cert.verify_for(rogue.verifying_key(), "server"),
            Err(CertificateError::BadSignature)
        ));
    }

    #[test]
    fn test_subject_mismatch_rejected() {
        let ca = SigningKeyPair::generate();
        let (_, cert) = issue_server_cert(&ca);

        assert!(matches!(
            cert.verify_for(ca.verifying_key(), "other"),
            Err(CertificateError::SubjectMismatch { .. })
        ));
    }

    #[test]
    fn test_expired_rejected() {
        let ca = SigningKeyPair::generate();
        let (_, cert) = issue_server_cert(&ca);

        let later = unix_now() + 7200;
        assert!(matches!(
            cert.verify(ca.verifying_key(), later),
            Err(CertificateError::Expired { .. })
        ));
    }

    #[test]
    fn test_tampered_subject_key_rejected() {
        let ca = SigningKeyPair::generate();
        let (_, mut cert) = issue_server_cert(&ca);
        let mallory = SigningKeyPair::generate();
        cert.tbs.subject_key = mallory.verifying_key().to_bytes();

        assert!(matches!(
            cert.verify_for(ca.verifying_key(), "server"),
            Err(CertificateError::BadSignature)
        ));
    }

    #[test]
    fn test_pem_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server_cert.pem");
        let ca = SigningKeyPair::generate();
        let (_, cert) = issue_server_cert(&ca);

        cert.save(&path).unwrap();
        let loaded = Certificate::load(&path).unwrap();
        assert_eq!(cert, loaded);
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        assert!(Certificate::from_bytes(&[0xFF; 7]).is_err());
    }
}
