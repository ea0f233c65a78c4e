//! Per-user mailboxes between connection handlers.
//!
//! Handlers never write to each other's sockets. A handler that has
//! something for another user drops a [`RelayMessage`] into that user's
//! [`Mailbox`]; the owner's handler picks it up either on its poll timer
//! ([`Relay::poll`]) or while blocked waiting for a reply ([`Relay::wait`]).
//! Each mailbox is FIFO and only its owner dequeues from it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

use crate::error::ChatResult;
use crate::protocol::{Opcode, ServerEvent};

/// Errors returned by the relay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Mailbox lock unavailable")]
    Unavailable,

    #[error("No mailbox for user id {0}")]
    UnknownRecipient(u32),
}

/// One message in transit between handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Recipient roster id.
    pub target: u32,
    /// What the recipient's client will see.
    pub opcode: Opcode,
    /// Body without the opcode. Always starts with the sender's id.
    pub payload: Vec<u8>,
}

impl RelayMessage {
    /// Wraps an event for `target`.
    pub fn from_event(target: u32, event: &ServerEvent) -> Self {
        Self {
            target,
            opcode: event.opcode(),
            payload: event.encode_body(),
        }
    }

    /// Sender id carried in the first four payload bytes.
    pub fn sender(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Decodes the payload.
    pub fn event(&self) -> ChatResult<ServerEvent> {
        ServerEvent::decode_body(self.opcode, &self.payload)
    }

    /// `opcode ‖ payload`, as forwarded to the client.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.opcode.as_u8());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// FIFO queue plus a wakeup for the owner.
#[derive(Debug, Default)]
pub struct Mailbox {
    queue: Mutex<VecDeque<RelayMessage>>,
    notify: Notify,
}

impl Mailbox {
    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<RelayMessage>>, RelayError> {
        self.queue.lock().map_err(|_| RelayError::Unavailable)
    }

    fn push(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.lock()?.push_back(message);
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Result<Option<RelayMessage>, RelayError> {
        Ok(self.lock()?.pop_front())
    }

    fn len(&self) -> Result<usize, RelayError> {
        Ok(self.lock()?.len())
    }

    fn drain(&self) -> Result<Vec<RelayMessage>, RelayError> {
        Ok(self.lock()?.drain(..).collect())
    }
}

/// One mailbox per roster id.
#[derive(Debug)]
pub struct Relay {
    mailboxes: Vec<Mailbox>,
}

impl Relay {
    /// Creates `users` empty mailboxes.
    pub fn new(users: usize) -> Self {
        Self {
            mailboxes: (0..users).map(|_| Mailbox::default()).collect(),
        }
    }

    fn mailbox(&self, id: u32) -> Result<&Mailbox, RelayError> {
        self.mailboxes
            .get(id as usize)
            .ok_or(RelayError::UnknownRecipient(id))
    }

    /// Enqueues `message` for its target and wakes a waiting owner.
    pub fn deliver(&self, message: RelayMessage) -> Result<(), RelayError> {
        self.mailbox(message.target)?.push(message)
    }

    /// Non-blocking dequeue; `None` when empty.
    pub fn poll(&self, id: u32) -> Result<Option<RelayMessage>, RelayError> {
        self.mailbox(id)?.pop()
    }

    /// Blocks until a message for `id` is available.
    ///
    /// Cancel-safe: a message is only removed when the future completes.
    pub async fn wait(&self, id: u32) -> Result<RelayMessage, RelayError> {
        let mailbox = self.mailbox(id)?;
        loop {
            let notified = mailbox.notify.notified();
            if let Some(message) = mailbox.pop()? {
                return Ok(message);
            }
            notified.await;
        }
    }

    /// Messages waiting for `id`.
    pub fn pending(&self, id: u32) -> Result<usize, RelayError> {
        self.mailbox(id)?.len()
    }

    /// Removes and returns everything waiting for `id`.
    pub fn drain(&self, id: u32) -> Result<Vec<RelayMessage>, RelayError> {
        self.mailbox(id)?.drain()
    }
}
