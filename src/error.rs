//! Error types shared by the server, the client and the protocol layer.

use thiserror::Error;

use crate::crypto::{CertificateError, SigningError};
use crate::registry::RegistryError;
use crate::relay::RelayError;

/// Result alias used across the crate.
pub type ChatResult<T> = Result<T, ChatError>;

/// Coarse classification of a [`ChatError`].
///
/// Everything except [`ErrorKind::Business`] ends the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Short or failed socket read/write.
    Transport,
    /// Malformed data, bad signature or tag, replay, unexpected state.
    Protocol,
    /// Shared state could not be reached safely.
    Resource,
    /// Request-level refusal reported back to the client.
    Business,
}

/// Errors that can occur while running the chat protocol.
#[derive(Error, Debug)]
pub enum ChatError {
    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// An operation did not finish in time.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// A length field exceeded its bound or was inconsistent.
    #[error("Invalid length for {field}: {len} (max {max})")]
    InvalidLength {
        /// Name of the offending field.
        field: &'static str,
        /// Length found on the wire.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// A message could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Handshake failed with the given reason.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// A handshake step was driven out of order.
    #[error("Invalid handshake transition: {from} -> {to}")]
    InvalidTransition {
        /// State the machine was in.
        from: &'static str,
        /// State that was requested.
        to: &'static str,
    },

    /// Signature or key material problem.
    #[error("Signature error: {0}")]
    Signing(#[from] SigningError),

    /// Certificate did not validate.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// AEAD tag mismatch or cipher failure.
    #[error("Frame authentication failed")]
    AuthenticationFailed,

    /// A frame repeated or went back in sequence.
    #[error("Replayed frame: expected sequence >= {expected}, got {got}")]
    Replay {
        /// Lowest acceptable sequence number.
        expected: u32,
        /// Sequence number found in the frame.
        got: u32,
    },

    /// The send counter would wrap.
    #[error("Sequence space exhausted, session must be closed")]
    SequenceExhausted,

    /// Unexpected opcode for the current state.
    #[error("Unexpected opcode 0x{0:02x}")]
    UnexpectedOpcode(u8),

    /// Registry failure.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Relay failure.
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Username is not part of the roster.
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// The user already has a live session.
    #[error("User already online: {0}")]
    AlreadyOnline(String),

    /// Key store lookup failed.
    #[error("Key error: {0}")]
    KeyError(String),
}

impl ChatError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::IoError(_) | ChatError::ConnectionClosed | ChatError::Timeout(_) => {
                ErrorKind::Transport
            }
            ChatError::InvalidLength { .. }
            | ChatError::Malformed(_)
            | ChatError::HandshakeFailed(_)
            | ChatError::InvalidTransition { .. }
            | ChatError::Signing(_)
            | ChatError::Certificate(_)
            | ChatError::AuthenticationFailed
            | ChatError::Replay { .. }
            | ChatError::SequenceExhausted
            | ChatError::UnexpectedOpcode(_) => ErrorKind::Protocol,
            ChatError::Registry(RegistryError::UnknownUser(_))
            | ChatError::Registry(RegistryError::AlreadyOnline(_)) => ErrorKind::Business,
            ChatError::Registry(_) | ChatError::Relay(_) | ChatError::KeyError(_) => {
                ErrorKind::Resource
            }
            ChatError::UnknownUser(_) | ChatError::AlreadyOnline(_) => ErrorKind::Business,
        }
    }

    /// Returns true if the connection must be torn down.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Business
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_are_fatal() {
        assert!(ChatError::AuthenticationFailed.is_fatal());
        assert!(ChatError::Replay { expected: 3, got: 1 }.is_fatal());
        assert_eq!(ChatError::SequenceExhausted.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_business_errors_are_recoverable() {
        let err = ChatError::UnknownUser("mallory".to_string());
        assert_eq!(err.kind(), ErrorKind::Business);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_registry_unavailable_is_resource() {
        let err: ChatError = RegistryError::Unavailable.into();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.is_fatal());
    }
}
