//! Client side of the chat protocol.
//!
//! [`ChatClient`] performs the handshake, checks the server certificate and
//! then exposes typed requests and [`ServerEvent`] notifications over the
//! secure channel.

use ed25519_dalek::VerifyingKey;
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::crypto::{load_verifying_key, public_key_path, SigningKeyPair};
use crate::error::{ChatError, ChatResult};
pub use crate::protocol::{OnlineUser, ServerEvent};
use crate::protocol::{ClientHandshake, Request, SecureChannel, M2};
use crate::transport::{Connection, TcpConnection};
use crate::DEFAULT_MAX_FRAME_LEN;

/// Base name of the CA public key inside a key directory.
pub const CA_KEY_NAME: &str = "ca";

/// What a client needs to authenticate itself and the server.
pub struct ClientIdentity {
    username: String,
    keys: SigningKeyPair,
    ca_key: VerifyingKey,
    server_name: String,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("username", &self.username)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl ClientIdentity {
    /// Builds an identity from loaded keys.
    pub fn new(
        username: impl Into<String>,
        keys: SigningKeyPair,
        ca_key: VerifyingKey,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            keys,
            ca_key,
            server_name: server_name.into(),
        }
    }

    /// Loads `<username>_privkey.pem` and `ca_pubkey.pem` from `key_dir`.
    pub fn load(key_dir: &Path, username: &str, server_name: &str) -> ChatResult<Self> {
        let keys = SigningKeyPair::load_from_dir(key_dir, username)?;
        let ca_key = load_verifying_key(&public_key_path(key_dir, CA_KEY_NAME))?;
        Ok(Self::new(username, keys, ca_key, server_name))
    }

    /// Login name.
    pub fn username(&self) -> &str {
        &self.username
    }
}

/// An authenticated connection to the chat server.
pub struct ChatClient<S = TcpStream> {
    conn: Connection<S>,
    channel: SecureChannel,
    user_id: u32,
    username: String,
    pending: VecDeque<ServerEvent>,
}

impl ChatClient<TcpStream> {
    /// Connects over TCP and runs the handshake.
    pub async fn connect<A: ToSocketAddrs>(addr: A, identity: &ClientIdentity) -> ChatResult<Self> {
        let conn = TcpConnection::connect(addr).await?;
        Self::handshake(conn, identity, DEFAULT_MAX_FRAME_LEN).await
    }
}

impl<S> ChatClient<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Runs the client handshake over an open connection.
    ///
    /// Fails before any key is derived if the certificate or the M2 signature
    /// does not check out.
    pub async fn handshake(
        mut conn: Connection<S>,
        identity: &ClientIdentity,
        max_frame_len: usize,
    ) -> ChatResult<Self> {
        let hs = ClientHandshake::new(identity.username.clone());
        conn.send_raw(&hs.m1().encode()).await?;

        let m2 = M2::read(conn.reader()).await?;
        let (m3, session_key) =
            hs.process_m2(&m2, &identity.keys, &identity.ca_key, &identity.server_name)?;
        conn.send_raw(&m3.encode()).await?;

        let mut channel = SecureChannel::new(session_key, max_frame_len);
        let first = channel.recv(conn.reader()).await?;
        let user_id = match ServerEvent::decode(&first)? {
            ServerEvent::UserId(id) => id,
            other => return Err(ChatError::UnexpectedOpcode(other.opcode().as_u8())),
        };
        debug!(user = %identity.username, id = user_id, "logged in");

        Ok(Self {
            conn,
            channel,
            user_id,
            username: identity.username.clone(),
            pending: VecDeque::new(),
        })
    }

    /// Roster id assigned by the server.
    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    /// Login name.
    pub fn username(&self) -> &str {
        &self.username
    }

    async fn request(&mut self, request: &Request) -> ChatResult<()> {
        self.channel
            .send(self.conn.writer(), &request.encode())
            .await
    }

    async fn read_event(&mut self) -> ChatResult<ServerEvent> {
        let payload = self.channel.recv(self.conn.reader()).await?;
        ServerEvent::decode(&payload)
    }

    /// Next notification from the server.
    pub async fn next_event(&mut self) -> ChatResult<ServerEvent> {
        match self.pending.pop_front() {
            Some(event) => Ok(event),
            None => self.read_event().await,
        }
    }

    /// Fetches the online list. Other events received meanwhile stay queued.
    pub async fn list_online(&mut self) -> ChatResult<Vec<OnlineUser>> {
        self.request(&Request::Online).await?;
        loop {
            match self.read_event().await? {
                ServerEvent::OnlineUsers(users) => return Ok(users),
                other => self.pending.push_back(other),
            }
        }
    }

    /// Proposes a chat. The answer arrives as [`ServerEvent::Accepted`] or
    /// [`ServerEvent::Refused`].
    pub async fn propose_chat(&mut self, peer: u32) -> ChatResult<()> {
        self.request(&Request::Chat { peer }).await
    }

    /// Accepts or refuses `peer`'s proposal.
    pub async fn answer_proposal(&mut self, peer: u32, accept: bool) -> ChatResult<()> {
        let request = if accept {
            Request::ChatPos { peer }
        } else {
            Request::ChatNeg { peer }
        };
        self.request(&request).await
    }

    /// Sends chat text to `peer`.
    pub async fn send_text(&mut self, peer: u32, text: &[u8]) -> ChatResult<()> {
        self.request(&Request::ChatResponse {
            peer,
            data: text.to_vec(),
        })
        .await
    }

    /// Sends opaque control bytes to `peer`.
    pub async fn send_control(&mut self, peer: u32, data: &[u8]) -> ChatResult<()> {
        self.request(&Request::Auth {
            peer,
            data: data.to_vec(),
        })
        .await
    }

    /// Ends the chat with `peer`.
    pub async fn stop_chat(&mut self, peer: u32) -> ChatResult<()> {
        self.request(&Request::StopChat { peer }).await
    }

    /// Says goodbye and closes the connection.
    pub async fn exit(mut self) -> ChatResult<()> {
        self.request(&Request::Exit).await?;
        self.conn.close().await
    }
}
