//! Mutual-authentication key exchange.
//!
//! ## Flow
//!
//! 1. Client sends `M1 = R1 ‖ username`
//! 2. Server sends `M2 = R2 ‖ Ks ‖ Sign_server(R1 ‖ R2 ‖ Ks) ‖ cert`
//! 3. Client checks the certificate against its trusted CA, then the
//!    signature with the certified key, and sends
//!    `M3 = Kc ‖ Sign_client(Kc ‖ R2)`
//! 4. Server checks the M3 signature with the key registered for `username`
//! 5. Both derive `SHA-256(X25519(own_secret, peer_public))`
//!
//! `Ks` and `Kc` are fresh X25519 public keys. The nonces tie each signature
//! to this run, so a recorded M2 or M3 cannot be replayed into another one.

use bytes::BufMut;
use ed25519_dalek::VerifyingKey;
use tokio::io::AsyncRead;
use zeroize::Zeroize;

use crate::crypto::{
    random_nonce, verify_signature, Certificate, EphemeralKeyPair, SessionKey, SigningKeyPair,
    EPHEMERAL_PUBLIC_LEN,
};
use crate::error::{ChatError, ChatResult};
use crate::transport::{put_field, read_array, read_field};
use crate::{
    MAX_CERTIFICATE_LEN, MAX_PUBLIC_KEY_LEN, MAX_SIGNATURE_LEN, MAX_USERNAME_LEN, NONCE_LEN,
};

/// Client hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M1 {
    pub r1: [u8; NONCE_LEN],
    pub username: String,
}

impl M1 {
    /// Wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(NONCE_LEN + 4 + self.username.len());
        buf.put_slice(&self.r1);
        put_field(&mut buf, self.username.as_bytes());
        buf
    }

    /// Reads M1 from a stream.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> ChatResult<Self> {
        let r1 = read_array::<NONCE_LEN, _>(reader).await?;
        let name = read_field(reader, "username", MAX_USERNAME_LEN).await?;
        let username = String::from_utf8(name)
            .map_err(|_| ChatError::Malformed("username is not UTF-8".to_string()))?;
        Ok(Self { r1, username })
    }
}

/// Server response carrying the server's ephemeral key and certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M2 {
    pub r2: [u8; NONCE_LEN],
    pub server_public: Vec<u8>,
    pub signature: Vec<u8>,
    pub certificate: Vec<u8>,
}

impl M2 {
    /// Wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_slice(&self.r2);
        put_field(&mut buf, &self.server_public);
        put_field(&mut buf, &self.signature);
        put_field(&mut buf, &self.certificate);
        buf
    }

    /// Reads M2 from a stream.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> ChatResult<Self> {
        Ok(Self {
            r2: read_array::<NONCE_LEN, _>(reader).await?,
            server_public: read_field(reader, "server_public", MAX_PUBLIC_KEY_LEN).await?,
            signature: read_field(reader, "signature", MAX_SIGNATURE_LEN).await?,
            certificate: read_field(reader, "certificate", MAX_CERTIFICATE_LEN).await?,
        })
    }

    /// Bytes covered by the server signature.
    pub fn signed_data(r1: &[u8; NONCE_LEN], r2: &[u8; NONCE_LEN], server_public: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(2 * NONCE_LEN + server_public.len());
        data.extend_from_slice(r1);
        data.extend_from_slice(r2);
        data.extend_from_slice(server_public);
        data
    }
}

/// Client proof of identity and ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3 {
    pub client_public: Vec<u8>,
    pub signature: Vec<u8>,
}

impl M3 {
    /// Wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_field(&mut buf, &self.client_public);
        put_field(&mut buf, &self.signature);
        buf
    }

    /// Reads M3 from a stream.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> ChatResult<Self> {
        Ok(Self {
            client_public: read_field(reader, "client_public", MAX_PUBLIC_KEY_LEN).await?,
            signature: read_field(reader, "signature", MAX_SIGNATURE_LEN).await?,
        })
    }

    /// Bytes covered by the client signature.
    pub fn signed_data(client_public: &[u8], r2: &[u8; NONCE_LEN]) -> Vec<u8> {
        let mut data = Vec::with_capacity(client_public.len() + NONCE_LEN);
        data.extend_from_slice(client_public);
        data.extend_from_slice(r2);
        data
    }
}

fn ephemeral_public(bytes: &[u8]) -> ChatResult<[u8; EPHEMERAL_PUBLIC_LEN]> {
    bytes.try_into().map_err(|_| ChatError::InvalidLength {
        field: "ephemeral_public",
        len: bytes.len(),
        max: EPHEMERAL_PUBLIC_LEN,
    })
}

/// Server-side handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    GotM1,
    SentM2,
    VerifiedM3,
    Established,
    Failed,
}

impl HandshakeState {
    /// State name for errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Start => "Start",
            HandshakeState::GotM1 => "GotM1",
            HandshakeState::SentM2 => "SentM2",
            HandshakeState::VerifiedM3 => "VerifiedM3",
            HandshakeState::Established => "Established",
            HandshakeState::Failed => "Failed",
        }
    }
}

/// Server side of the handshake as an explicit state machine.
///
/// Steps must be driven in order. Any error moves the machine to
/// [`HandshakeState::Failed`] and wipes the transcript; a failed machine
/// accepts no further input.
pub struct ServerHandshake {
    state: HandshakeState,
    r1: [u8; NONCE_LEN],
    r2: [u8; NONCE_LEN],
    username: Option<String>,
    ephemeral: Option<EphemeralKeyPair>,
    session_key: Option<SessionKey>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    /// A machine in [`HandshakeState::Start`].
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Start,
            r1: [0; NONCE_LEN],
            r2: [0; NONCE_LEN],
            username: None,
            ephemeral: None,
            session_key: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Username claimed in M1.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    fn advance(&mut self, from: HandshakeState, to: HandshakeState) -> ChatResult<()> {
        if self.state != from {
            let err = ChatError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            };
            self.fail();
            return Err(err);
        }
        self.state = to;
        Ok(())
    }

    /// Start → GotM1. Roster and online checks are the caller's job.
    pub fn receive_m1(&mut self, m1: M1) -> ChatResult<()> {
        self.advance(HandshakeState::Start, HandshakeState::GotM1)?;
        self.r1 = m1.r1;
        self.username = Some(m1.username);
        Ok(())
    }

    /// GotM1 → SentM2. Generates R2 and the server ephemeral key.
    pub fn build_m2(&mut self, signer: &SigningKeyPair, certificate: &[u8]) -> ChatResult<M2> {
        self.advance(HandshakeState::GotM1, HandshakeState::SentM2)?;
        self.r2 = random_nonce();
        let ephemeral = EphemeralKeyPair::generate();
        let server_public = ephemeral.public_bytes().to_vec();
        let signature = signer.sign(&M2::signed_data(&self.r1, &self.r2, &server_public));
        self.ephemeral = Some(ephemeral);
        Ok(M2 {
            r2: self.r2,
            server_public,
            signature,
            certificate: certificate.to_vec(),
        })
    }

    /// SentM2 → VerifiedM3. Checks the client signature and derives the key.
    pub fn verify_m3(&mut self, m3: &M3, client_key: &VerifyingKey) -> ChatResult<()> {
        self.advance(HandshakeState::SentM2, HandshakeState::VerifiedM3)?;
        let result = self.check_m3(m3, client_key);
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn check_m3(&mut self, m3: &M3, client_key: &VerifyingKey) -> ChatResult<()> {
        let client_public = ephemeral_public(&m3.client_public)?;
        verify_signature(&M3::signed_data(&m3.client_public, &self.r2), &m3.signature, client_key)
            .map_err(|_| ChatError::HandshakeFailed("client signature invalid".to_string()))?;
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| ChatError::HandshakeFailed("missing ephemeral key".to_string()))?;
        self.session_key = Some(ephemeral.agree(&client_public));
        Ok(())
    }

    /// VerifiedM3 → Established. Hands out the session key and wipes the transcript.
    pub fn establish(&mut self) -> ChatResult<SessionKey> {
        self.advance(HandshakeState::VerifiedM3, HandshakeState::Established)?;
        let key = self
            .session_key
            .take()
            .ok_or_else(|| ChatError::HandshakeFailed("missing session key".to_string()))?;
        self.wipe();
        Ok(key)
    }

    /// Moves to Failed and discards the transcript.
    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
        self.wipe();
    }

    fn wipe(&mut self) {
        self.r1.zeroize();
        self.r2.zeroize();
        self.ephemeral = None;
        self.session_key = None;
    }
}

impl Drop for ServerHandshake {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Client side of the handshake.
pub struct ClientHandshake {
    username: String,
    r1: [u8; NONCE_LEN],
}

impl ClientHandshake {
    /// Starts a handshake for `username` with a fresh R1.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            r1: random_nonce(),
        }
    }

    /// The M1 to send.
    pub fn m1(&self) -> M1 {
        M1 {
            r1: self.r1,
            username: self.username.clone(),
        }
    }

    /// Authenticates the server from M2 and produces M3 plus the session key.
    ///
    /// The certificate must be signed by `ca_key`, name `server_name` and be
    /// within its validity window; only then is the M2 signature checked with
    /// the certified key. No ephemeral key is generated before both pass.
    pub fn process_m2(
        mut self,
        m2: &M2,
        identity: &SigningKeyPair,
        ca_key: &VerifyingKey,
        server_name: &str,
    ) -> ChatResult<(M3, SessionKey)> {
        let certificate = Certificate::from_bytes(&m2.certificate)?;
        let server_key = certificate.verify_for(ca_key, server_name)?;

        let server_public = ephemeral_public(&m2.server_public)?;
        verify_signature(
            &M2::signed_data(&self.r1, &m2.r2, &m2.server_public),
            &m2.signature,
            &server_key,
        )
        .map_err(|_| ChatError::HandshakeFailed("server signature invalid".to_string()))?;

        let ephemeral = EphemeralKeyPair::generate();
        let client_public = ephemeral.public_bytes().to_vec();
        let signature = identity.sign(&M3::signed_data(&client_public, &m2.r2));
        let key = ephemeral.agree(&server_public);
        self.r1.zeroize();

        Ok((
            M3 {
                client_public,
                signature,
            },
            key,
        ))
    }
}

impl Drop for ClientHandshake {
    fn drop(&mut self) {
        self.r1.zeroize();
    }
}
