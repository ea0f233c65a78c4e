//! Chat protocol types and operations.
//!
//! - **Handshake**: certificate-backed mutual authentication and key agreement
//! - **Secure channel**: AEAD frames with sequence-number anti-replay
//! - **Messages**: opcode-tagged application payloads in both directions

mod channel;
mod handshake;
mod message;
mod opcode;

pub use channel::{read_frame, RawFrame, SecureChannel};
pub use handshake::{ClientHandshake, HandshakeState, ServerHandshake, M1, M2, M3};
pub use message::{OnlineUser, Request, ServerEvent, MAX_KEY_PEM_LEN, MAX_RELAY_DATA_LEN};
pub use opcode::Opcode;
