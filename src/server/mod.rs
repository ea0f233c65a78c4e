//! Chat server: accept loop, server-side handshake and shared state.
//!
//! Every accepted connection gets its own task. The tasks share the
//! [`Registry`], the [`Relay`] and the read-only identity and key store, and
//! nothing else.

mod handler;

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::crypto::{Certificate, KeyStore, SessionKey, SigningKeyPair, UserKey};
use crate::error::{ChatError, ChatResult, ErrorKind};
use crate::protocol::{ServerHandshake, M1, M3};
use crate::registry::{ConnectionHandle, Registry};
use crate::relay::Relay;
use crate::transport::{Connection, TcpListener};

/// The server's signing key and its CA-issued certificate.
pub struct ServerIdentity {
    keys: SigningKeyPair,
    certificate: Vec<u8>,
    name: String,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl ServerIdentity {
    /// Pairs a key with its certificate, checking that they match.
    pub fn new(keys: SigningKeyPair, certificate: &Certificate) -> ChatResult<Self> {
        if certificate.subject_key()? != *keys.verifying_key() {
            return Err(ChatError::KeyError(
                "certificate does not certify the server key".to_string(),
            ));
        }
        Ok(Self {
            keys,
            certificate: certificate.to_bytes()?,
            name: certificate.subject().to_string(),
        })
    }

    /// Loads the key and certificate named in `config`.
    pub fn load(config: &ServerConfig) -> ChatResult<Self> {
        let keys = SigningKeyPair::load_from_dir(&config.key_dir, &config.server_key)?;
        let certificate = Certificate::load(&config.server_cert)?;
        if certificate.subject() != config.server_name {
            return Err(ChatError::KeyError(format!(
                "certificate subject {} does not match server_name {}",
                certificate.subject(),
                config.server_name
            )));
        }
        Self::new(keys, &certificate)
    }

    /// Certificate subject.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Result of a successful server-side handshake.
struct Authenticated {
    id: u32,
    username: String,
    key: UserKey,
    session_key: SessionKey,
}

/// Shared server state. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    identity: Arc<ServerIdentity>,
    registry: Arc<Registry>,
    relay: Arc<Relay>,
    keys: KeyStore,
}

impl Server {
    /// Builds the registry and one mailbox per roster user.
    pub fn new(config: ServerConfig, identity: ServerIdentity) -> Self {
        let registry = Registry::new(config.roster.as_slice());
        let relay = Relay::new(config.roster.len());
        let keys = KeyStore::new(&config.key_dir);
        Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            registry: Arc::new(registry),
            relay: Arc::new(relay),
            keys,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The shared user table.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The shared mailboxes.
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> ChatResult<TcpListener> {
        TcpListener::bind(self.config.bind_addr.as_str()).await
    }

    /// Binds and serves until the process stops.
    pub async fn serve(self) -> ChatResult<()> {
        let listener = self.bind().await?;
        self.run(listener).await
    }

    /// Accepts connections forever, one task each.
    pub async fn run(self, listener: TcpListener) -> ChatResult<()> {
        let addr = listener.local_addr()?;
        info!(
            %addr,
            users = self.config.roster.len(),
            "server listening"
        );
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(conn).await;
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }

    /// Runs one connection to completion and logs how it ended.
    pub async fn handle_connection<S>(&self, conn: Connection<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = conn.peer_addr().to_string();
        let handle = ConnectionHandle::next();
        debug!(%peer, %handle, "connection accepted");

        match self.run_connection(conn, handle).await {
            Ok(()) => debug!(%peer, %handle, "connection finished"),
            Err(e) if e.kind() == ErrorKind::Business => info!(%peer, %handle, "refused: {}", e),
            Err(ChatError::ConnectionClosed) => debug!(%peer, %handle, "peer closed connection"),
            Err(e) => warn!(%peer, %handle, "connection terminated: {}", e),
        }
    }

    async fn run_connection<S>(&self, mut conn: Connection<S>, handle: ConnectionHandle) -> ChatResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let limit = self.config.handshake_timeout();
        let auth = tokio::time::timeout(limit, self.handshake(&mut conn))
            .await
            .map_err(|_| ChatError::Timeout(limit.as_secs()))??;

        // Anything left from a previous session is stale.
        let stale = self.relay.drain(auth.id)?;
        if !stale.is_empty() {
            debug!(user = %auth.username, count = stale.len(), "discarded stale mailbox");
        }
        self.registry.set_online(auth.id, handle)?;
        info!(user = %auth.username, id = auth.id, %handle, "user online");

        handler::run(self, conn, handle, auth).await
    }

    async fn handshake<S>(&self, conn: &mut Connection<S>) -> ChatResult<Authenticated>
    where
        S: AsyncRead + AsyncWrite,
    {
        let mut hs = ServerHandshake::new();
        let result = self.drive_handshake(&mut hs, conn).await;
        if result.is_err() {
            hs.fail();
        }
        result
    }

    async fn drive_handshake<S>(
        &self,
        hs: &mut ServerHandshake,
        conn: &mut Connection<S>,
    ) -> ChatResult<Authenticated>
    where
        S: AsyncRead + AsyncWrite,
    {
        let m1 = M1::read(conn.reader()).await?;
        let username = m1.username.clone();
        hs.receive_m1(m1)?;

        let id = self.registry.lookup_id_by_username(&username)?;
        if self.registry.is_online(id)? {
            return Err(ChatError::AlreadyOnline(username));
        }
        let key = self
            .keys
            .load(&username)
            .map_err(|e| ChatError::KeyError(format!("{}: {}", username, e)))?;

        let m2 = hs.build_m2(&self.identity.keys, &self.identity.certificate)?;
        conn.send_raw(&m2.encode()).await?;

        let m3 = M3::read(conn.reader()).await?;
        hs.verify_m3(&m3, &key.verifying_key)?;
        let session_key = hs.establish()?;
        debug!(user = %username, "handshake complete");

        Ok(Authenticated {
            id,
            username,
            key,
            session_key,
        })
    }
}
