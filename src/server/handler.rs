//! Per-connection event loop after a successful handshake.
//!
//! The loop owns the secure channel and alternates between two sources:
//! frames from the client (pumped by a reader task into a channel, so the
//! `select!` below stays cancel-safe) and the mailbox poll timer. While an
//! outgoing chat proposal is pending, the loop blocks on the mailbox alone
//! with the timer suspended.

use std::collections::BTreeSet;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Authenticated, Server};
use crate::error::{ChatError, ChatResult};
use crate::protocol::{read_frame, Opcode, RawFrame, Request, SecureChannel, ServerEvent};
use crate::registry::{ConnectionHandle, Registry};
use crate::relay::{Relay, RelayError, RelayMessage};
use crate::timer::PollTimer;
use crate::transport::{Connection, ConnectionReader, ConnectionWriter};

/// Frames buffered between the reader task and the event loop.
const FRAME_QUEUE_DEPTH: usize = 16;

/// Releases the user's registry state and answers orphaned proposals,
/// whichever way the handler exits.
struct SessionGuard<'a> {
    registry: &'a Registry,
    relay: &'a Relay,
    id: u32,
    username: &'a str,
    handle: ConnectionHandle,
    /// Proposers whose proposal reached our client but is not answered yet.
    proposers: BTreeSet<u32>,
}

impl SessionGuard<'_> {
    fn refuse(&self, proposer: u32) {
        let refusal = RelayMessage::from_event(proposer, &ServerEvent::Refused { peer: self.id });
        if let Err(e) = self.relay.deliver(refusal) {
            warn!(user = %self.username, proposer, "could not refuse proposal: {}", e);
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        match self.registry.release(self.id, self.handle) {
            Ok(true) => info!(user = %self.username, handle = %self.handle, "user offline"),
            Ok(false) => {}
            Err(e) => warn!(user = %self.username, "could not release registry entry: {}", e),
        }

        // Proposers blocked on us get a refusal instead of waiting for the timeout.
        let pending = self.relay.drain(self.id).unwrap_or_else(|e| {
            warn!(user = %self.username, "could not drain mailbox: {}", e);
            Vec::new()
        });
        let queued = pending
            .into_iter()
            .filter(|m| m.opcode == Opcode::Chat)
            .filter_map(|m| m.sender());
        let proposers: BTreeSet<u32> = queued.chain(self.proposers.iter().copied()).collect();
        for proposer in proposers {
            self.refuse(proposer);
        }
    }
}

/// Clears the busy flags taken for one proposal.
struct ProposalGuard<'a> {
    registry: &'a Registry,
    initiator: u32,
    peer: Option<u32>,
}

impl Drop for ProposalGuard<'_> {
    fn drop(&mut self) {
        for id in std::iter::once(self.initiator).chain(self.peer) {
            if let Err(e) = self.registry.clear_busy(id) {
                warn!(id, "could not clear busy flag: {}", e);
            }
        }
    }
}

enum Flow {
    Continue,
    Exit,
}

struct Handler<'a, S> {
    server: &'a Server,
    session: SessionGuard<'a>,
    id: u32,
    username: &'a str,
    public_key: &'a [u8],
    channel: SecureChannel,
    writer: ConnectionWriter<S>,
    timer: PollTimer,
    frames: mpsc::Receiver<ChatResult<RawFrame>>,
}

/// Runs the session for an authenticated, already registered user.
pub(super) async fn run<S>(
    server: &Server,
    conn: Connection<S>,
    handle: ConnectionHandle,
    auth: Authenticated,
) -> ChatResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let Authenticated {
        id,
        username,
        key,
        session_key,
    } = auth;

    let session = SessionGuard {
        registry: &server.registry,
        relay: &server.relay,
        id,
        username: &username,
        handle,
        proposers: BTreeSet::new(),
    };

    let max_frame_len = server.config.max_frame_len;
    let (reader, writer) = conn.into_split();
    let (frame_tx, frames) = mpsc::channel(FRAME_QUEUE_DEPTH);
    let reader_task = tokio::spawn(pump_frames(reader, max_frame_len, frame_tx));

    let mut handler = Handler {
        server,
        session,
        id,
        username: &username,
        public_key: &key.pem,
        channel: SecureChannel::new(session_key, max_frame_len),
        writer,
        timer: PollTimer::new(server.config.poll_interval()),
        frames,
    };

    let result = handler.run().await;
    reader_task.abort();
    let _ = handler.writer.shutdown().await;
    result
}

/// Reads raw frames until the stream ends or a read fails.
async fn pump_frames<S>(
    mut reader: ConnectionReader<S>,
    max_frame_len: usize,
    tx: mpsc::Sender<ChatResult<RawFrame>>,
) where
    S: AsyncRead,
{
    loop {
        let frame = read_frame(&mut reader, max_frame_len).await;
        let failed = frame.is_err();
        if tx.send(frame).await.is_err() || failed {
            break;
        }
    }
}

impl<S> Handler<'_, S>
where
    S: AsyncRead + AsyncWrite,
{
    async fn run(&mut self) -> ChatResult<()> {
        self.send_event(&ServerEvent::UserId(self.id)).await?;

        loop {
            tokio::select! {
                _ = self.timer.tick() => {
                    if let Some(message) = self.server.relay.poll(self.id)? {
                        self.deliver_polled(message).await?;
                    }
                    self.timer.rearm();
                }
                frame = self.frames.recv() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(ChatError::ConnectionClosed)) | None => {
                            debug!(user = %self.username, "client disconnected");
                            return Ok(());
                        }
                        Some(Err(e)) => return Err(e),
                    };
                    let payload = self.channel.open_frame(&frame)?;
                    let request = match Request::decode(&payload) {
                        Ok(request) => request,
                        Err(ChatError::UnexpectedOpcode(op)) => {
                            debug!(user = %self.username, opcode = op, "ignoring unknown opcode");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    if let Flow::Exit = self.dispatch(request).await? {
                        info!(user = %self.username, "client exit");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> ChatResult<Flow> {
        debug!(user = %self.username, op = %request.opcode(), "request");
        match request {
            Request::Online => {
                let users = self.server.registry.online_users()?;
                self.send_event(&ServerEvent::OnlineUsers(users)).await?;
            }
            Request::Chat { peer } => self.propose(peer).await?,
            Request::ChatPos { peer } => {
                self.session.proposers.remove(&peer);
                let accept = ServerEvent::Accepted {
                    from: self.id,
                    username: self.username.to_string(),
                    public_key: self.public_key.to_vec(),
                };
                self.relay_to(peer, &accept)?;
            }
            Request::ChatNeg { peer } => {
                self.session.proposers.remove(&peer);
                self.relay_to(peer, &ServerEvent::Refused { peer: self.id })?;
            }
            Request::StopChat { peer } => {
                self.relay_to(peer, &ServerEvent::ChatStopped { peer: self.id })?;
            }
            Request::Auth { peer, data } => {
                self.relay_if_online(peer, ServerEvent::Control { from: self.id, data })
                    .await?;
            }
            Request::ChatResponse { peer, data } => {
                self.relay_if_online(peer, ServerEvent::Text { from: self.id, data })
                    .await?;
            }
            Request::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    /// Starts a chat with `peer` and waits for the answer.
    async fn propose(&mut self, peer: u32) -> ChatResult<()> {
        let server = self.server;
        let registry: &Registry = &server.registry;

        if !registry.try_mark_busy(self.id)? {
            debug!(user = %self.username, peer, "proposal refused: already busy");
            return self.send_event(&ServerEvent::Refused { peer }).await;
        }
        let mut guard = ProposalGuard {
            registry,
            initiator: self.id,
            peer: None,
        };

        if peer == self.id || !registry.try_mark_busy(peer)? {
            debug!(user = %self.username, peer, "proposal refused: peer unavailable");
            return self.send_event(&ServerEvent::Refused { peer }).await;
        }
        guard.peer = Some(peer);

        let proposal = ServerEvent::Proposal {
            from: self.id,
            username: self.username.to_string(),
            public_key: self.public_key.to_vec(),
        };
        server
            .relay
            .deliver(RelayMessage::from_event(peer, &proposal))?;
        // The peer may have left between the busy check and the delivery,
        // after its session already drained the mailbox.
        if !registry.is_online(peer)? {
            debug!(user = %self.username, peer, "proposal refused: peer left");
            return self.send_event(&ServerEvent::Refused { peer }).await;
        }
        info!(user = %self.username, peer, "chat proposed");

        self.timer.suspend();
        let outcome = self.await_answer(peer).await;
        self.timer.resume();
        let (answer, deferred) = outcome?;

        match answer {
            Some(message) => self.forward(&message).await?,
            None => {
                info!(user = %self.username, peer, "proposal timed out");
                self.send_event(&ServerEvent::Refused { peer }).await?;
            }
        }
        drop(guard);

        for message in deferred {
            self.deliver_polled(message).await?;
        }
        Ok(())
    }

    /// Blocks on the mailbox until `peer` answers or the proposal times out.
    ///
    /// Unrelated messages that arrive meanwhile are returned for later delivery.
    async fn await_answer(
        &self,
        peer: u32,
    ) -> ChatResult<(Option<RelayMessage>, Vec<RelayMessage>)> {
        let relay: &Relay = &self.server.relay;
        let deadline = Instant::now() + self.server.config.proposal_timeout();
        let mut deferred = Vec::new();

        loop {
            match tokio::time::timeout_at(deadline, relay.wait(self.id)).await {
                Err(_) => return Ok((None, deferred)),
                Ok(message) => {
                    let message = message?;
                    let is_answer = message.sender() == Some(peer)
                        && matches!(message.opcode, Opcode::ChatPos | Opcode::ChatNeg);
                    if is_answer {
                        return Ok((Some(message), deferred));
                    }
                    deferred.push(message);
                }
            }
        }
    }

    /// Enqueues `event` for `peer`; unknown ids are dropped.
    fn relay_to(&self, peer: u32, event: &ServerEvent) -> ChatResult<()> {
        match self
            .server
            .relay
            .deliver(RelayMessage::from_event(peer, event))
        {
            Ok(()) => Ok(()),
            Err(RelayError::UnknownRecipient(id)) => {
                debug!(user = %self.username, id, "dropping message for unknown user");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Relays chat traffic, or tells our client the chat is over if `peer` left.
    async fn relay_if_online(&mut self, peer: u32, event: ServerEvent) -> ChatResult<()> {
        if self.server.registry.is_online(peer)? {
            self.relay_to(peer, &event)
        } else {
            self.send_event(&ServerEvent::ChatStopped { peer }).await
        }
    }

    /// Forwards a mailbox message outside of a proposal wait.
    ///
    /// Answers only count while `await_answer` is running; a late accept is
    /// answered with STOP_CHAT so the peer drops the chat, a late refusal is
    /// discarded.
    async fn deliver_polled(&mut self, message: RelayMessage) -> ChatResult<()> {
        match (message.opcode, message.sender()) {
            (Opcode::ChatPos, Some(peer)) => {
                debug!(user = %self.username, peer, "late accept, stopping chat");
                self.relay_to(peer, &ServerEvent::ChatStopped { peer: self.id })
            }
            (Opcode::ChatNeg, _) => {
                debug!(user = %self.username, "discarding late refusal");
                Ok(())
            }
            (Opcode::Chat, Some(proposer)) => {
                self.session.proposers.insert(proposer);
                self.forward(&message).await
            }
            _ => self.forward(&message).await,
        }
    }

    async fn forward(&mut self, message: &RelayMessage) -> ChatResult<()> {
        debug!(user = %self.username, op = %message.opcode, "delivering relayed message");
        let wire = message.to_wire();
        self.channel.send(&mut self.writer, &wire).await
    }

    async fn send_event(&mut self, event: &ServerEvent) -> ChatResult<()> {
        self.channel.send(&mut self.writer, &event.encode()).await
    }
}
