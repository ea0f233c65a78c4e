//! # securechat - certificate-authenticated chat relay
//!
//! A chat server where every client proves its identity with a signed
//! ephemeral key exchange before any application traffic flows, and where
//! every post-handshake message travels in an authenticated, sequenced frame.
//!
//! ## Overview
//!
//! ```text
//! Client                                   Server (one task per connection)
//!   |  M1: R1 | username                     |
//!   |--------------------------------------->|  roster + online check
//!   |  M2: R2 | Ks_pub | sig(R1|R2|Ks) | cert|
//!   |<---------------------------------------|
//!   |  M3: Kc_pub | sig(Kc|R2)               |
//!   |--------------------------------------->|  verify with <user>_pubkey.pem
//!   |                                        |
//!   |  [both: key = SHA-256(X25519(..))]     |
//!   |                                        |
//!   |<========= USRID | id (sealed) =========|
//!   |<========= sealed frames ==============>|<--> Registry / Relay
//! ```
//!
//! Connection handlers never talk to each other directly. They share a
//! [`registry::Registry`] (online / busy state) and a [`relay::Relay`]
//! (one mailbox per roster user) and nothing else.
//!
//! ## Modules
//!
//! - [`crypto`]: AEAD, signatures, ephemeral key agreement, certificates, key store
//! - [`protocol`]: opcodes, handshake messages and state machines, the secure channel
//! - [`registry`]: shared user table with online/busy arbitration
//! - [`relay`]: per-user mailboxes between connection handlers
//! - [`timer`]: suspendable mailbox poll timer
//! - [`server`]: accept loop and per-connection handler
//! - [`client`]: client side of the protocol
//! - [`transport`]: byte-stream connection with bounded length-prefixed reads

/// Size of the handshake freshness nonces R1 and R2.
pub const NONCE_LEN: usize = 16;

/// AEAD nonce (IV) size carried in every frame.
pub const IV_LEN: usize = 12;

/// AEAD authentication tag size carried in every frame.
pub const TAG_LEN: usize = 16;

/// Session key size.
pub const KEY_LEN: usize = 32;

/// Size of the sequence number prefixed to every sealed plaintext.
pub const SEQ_LEN: usize = 4;

/// Fixed part of a secure-channel frame: length, IV and tag.
pub const FRAME_HEADER_LEN: usize = 4 + IV_LEN + TAG_LEN;

/// Upper bound for usernames on the wire.
pub const MAX_USERNAME_LEN: usize = 32;

/// Upper bound for an ephemeral public key on the wire.
pub const MAX_PUBLIC_KEY_LEN: usize = 64;

/// Upper bound for a signature on the wire.
pub const MAX_SIGNATURE_LEN: usize = 128;

/// Upper bound for a serialized certificate on the wire.
pub const MAX_CERTIFICATE_LEN: usize = 4096;

/// Default upper bound for a sealed frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod timer;
pub mod transport;

pub use client::{ChatClient, ClientIdentity, ServerEvent};
pub use config::ServerConfig;
pub use error::{ChatError, ChatResult, ErrorKind};
pub use protocol::{Opcode, SecureChannel};
pub use registry::{ConnectionHandle, Registry, UserRecord};
pub use relay::{Mailbox, Relay, RelayMessage};
pub use server::{Server, ServerIdentity};
