//! Application payloads carried inside secure-channel frames.
//!
//! Every payload starts with an [`Opcode`]. The same opcode can mean
//! different things depending on direction: `CHAT ‖ peer` from a client is a
//! request, while `CHAT ‖ from ‖ name ‖ key` from the server is a delivered
//! proposal. Each direction therefore has its own type.

use bytes::BufMut;

use crate::error::{ChatError, ChatResult};
use crate::protocol::Opcode;
use crate::transport::{put_field, PayloadReader};
use crate::MAX_USERNAME_LEN;

/// Upper bound for a relayed PEM public key.
pub const MAX_KEY_PEM_LEN: usize = 1024;

/// Upper bound for relayed chat or control bytes.
pub const MAX_RELAY_DATA_LEN: usize = 16 * 1024;

/// One entry of the online list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub id: u32,
    pub username: String,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask for the online list.
    Online,
    /// Propose a chat to `peer`.
    Chat { peer: u32 },
    /// Accept `peer`'s proposal.
    ChatPos { peer: u32 },
    /// Refuse `peer`'s proposal.
    ChatNeg { peer: u32 },
    /// End the chat with `peer`.
    StopChat { peer: u32 },
    /// Opaque control bytes for `peer`.
    Auth { peer: u32, data: Vec<u8> },
    /// Chat text for `peer`.
    ChatResponse { peer: u32, data: Vec<u8> },
    /// Leave.
    Exit,
}

impl Request {
    /// Opcode of this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Online => Opcode::Online,
            Request::Chat { .. } => Opcode::Chat,
            Request::ChatPos { .. } => Opcode::ChatPos,
            Request::ChatNeg { .. } => Opcode::ChatNeg,
            Request::StopChat { .. } => Opcode::StopChat,
            Request::Auth { .. } => Opcode::Auth,
            Request::ChatResponse { .. } => Opcode::ChatResponse,
            Request::Exit => Opcode::Exit,
        }
    }

    /// Wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode().as_u8()];
        match self {
            Request::Online | Request::Exit => {}
            Request::Chat { peer }
            | Request::ChatPos { peer }
            | Request::ChatNeg { peer }
            | Request::StopChat { peer } => buf.put_u32(*peer),
            Request::Auth { peer, data } | Request::ChatResponse { peer, data } => {
                buf.put_u32(*peer);
                put_field(&mut buf, data);
            }
        }
        buf
    }

    /// Parses a decrypted client payload.
    ///
    /// Unknown opcodes yield [`ChatError::UnexpectedOpcode`]; truncated or
    /// oversized fields yield a protocol error.
    pub fn decode(payload: &[u8]) -> ChatResult<Self> {
        let (&first, rest) = payload
            .split_first()
            .ok_or_else(|| ChatError::Malformed("empty payload".to_string()))?;
        let op = Opcode::try_from(first)?;
        let mut r = PayloadReader::new(rest);

        let request = match op {
            Opcode::Online => Request::Online,
            Opcode::Exit => Request::Exit,
            Opcode::Chat => Request::Chat { peer: r.u32("peer")? },
            Opcode::ChatPos => Request::ChatPos { peer: r.u32("peer")? },
            Opcode::ChatNeg => Request::ChatNeg { peer: r.u32("peer")? },
            Opcode::StopChat => Request::StopChat { peer: r.u32("peer")? },
            Opcode::Auth => Request::Auth {
                peer: r.u32("peer")?,
                data: r.field("data", MAX_RELAY_DATA_LEN)?.to_vec(),
            },
            Opcode::ChatResponse => Request::ChatResponse {
                peer: r.u32("peer")?,
                data: r.field("data", MAX_RELAY_DATA_LEN)?.to_vec(),
            },
            Opcode::UsrId => return Err(ChatError::UnexpectedOpcode(first)),
        };
        r.finish()?;
        Ok(request)
    }
}

/// Server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The caller's roster id, first frame after the handshake.
    UserId(u32),
    /// Users currently online.
    OnlineUsers(Vec<OnlineUser>),
    /// `from` proposes a chat.
    Proposal {
        from: u32,
        username: String,
        public_key: Vec<u8>,
    },
    /// `from` accepted our proposal.
    Accepted {
        from: u32,
        username: String,
        public_key: Vec<u8>,
    },
    /// `peer` refused, is busy, or is offline.
    Refused { peer: u32 },
    /// `peer` ended the chat or went away.
    ChatStopped { peer: u32 },
    /// Control bytes from `from`.
    Control { from: u32, data: Vec<u8> },
    /// Chat text from `from`.
    Text { from: u32, data: Vec<u8> },
}

impl ServerEvent {
    /// Opcode of this event.
    pub fn opcode(&self) -> Opcode {
        match self {
            ServerEvent::UserId(_) => Opcode::UsrId,
            ServerEvent::OnlineUsers(_) => Opcode::Online,
            ServerEvent::Proposal { .. } => Opcode::Chat,
            ServerEvent::Accepted { .. } => Opcode::ChatPos,
            ServerEvent::Refused { .. } => Opcode::ChatNeg,
            ServerEvent::ChatStopped { .. } => Opcode::StopChat,
            ServerEvent::Control { .. } => Opcode::Auth,
            ServerEvent::Text { .. } => Opcode::ChatResponse,
        }
    }

    /// Encoding without the opcode byte.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ServerEvent::UserId(id) => buf.put_u32(*id),
            ServerEvent::OnlineUsers(users) => {
                buf.put_u32(users.len() as u32);
                for user in users {
                    buf.put_u32(user.id);
                    put_field(&mut buf, user.username.as_bytes());
                }
            }
            ServerEvent::Proposal {
                from,
                username,
                public_key,
            }
            | ServerEvent::Accepted {
                from,
                username,
                public_key,
            } => {
                buf.put_u32(*from);
                put_field(&mut buf, username.as_bytes());
                put_field(&mut buf, public_key);
            }
            ServerEvent::Refused { peer } | ServerEvent::ChatStopped { peer } => buf.put_u32(*peer),
            ServerEvent::Control { from, data } | ServerEvent::Text { from, data } => {
                buf.put_u32(*from);
                put_field(&mut buf, data);
            }
        }
        buf
    }

    /// Full wire encoding.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(self.opcode().as_u8());
        buf.extend_from_slice(&body);
        buf
    }

    /// Parses the body of an event whose opcode is already known.
    pub fn decode_body(op: Opcode, body: &[u8]) -> ChatResult<Self> {
        let mut r = PayloadReader::new(body);
        let event = match op {
            Opcode::UsrId => ServerEvent::UserId(r.u32("id")?),
            Opcode::Online => {
                let count = r.u32("count")? as usize;
                // Each entry is at least id + length prefix.
                let mut users = Vec::with_capacity(count.min(r.remaining() / 8));
                for _ in 0..count {
                    let id = r.u32("id")?;
                    let username = r.string("username", MAX_USERNAME_LEN)?;
                    users.push(OnlineUser { id, username });
                }
                ServerEvent::OnlineUsers(users)
            }
            Opcode::Chat | Opcode::ChatPos => {
                let from = r.u32("from")?;
                let username = r.string("username", MAX_USERNAME_LEN)?;
                let public_key = r.field("public_key", MAX_KEY_PEM_LEN)?.to_vec();
                if op == Opcode::Chat {
                    ServerEvent::Proposal {
                        from,
                        username,
                        public_key,
                    }
                } else {
                    ServerEvent::Accepted {
                        from,
                        username,
                        public_key,
                    }
                }
            }
            Opcode::ChatNeg => ServerEvent::Refused { peer: r.u32("peer")? },
            Opcode::StopChat => ServerEvent::ChatStopped { peer: r.u32("peer")? },
            Opcode::Auth => ServerEvent::Control {
                from: r.u32("from")?,
                data: r.field("data", MAX_RELAY_DATA_LEN)?.to_vec(),
            },
            Opcode::ChatResponse => ServerEvent::Text {
                from: r.u32("from")?,
                data: r.field("data", MAX_RELAY_DATA_LEN)?.to_vec(),
            },
            Opcode::Exit => return Err(ChatError::UnexpectedOpcode(op.as_u8())),
        };
        r.finish()?;
        Ok(event)
    }

    /// Parses a decrypted server payload.
    pub fn decode(payload: &[u8]) -> ChatResult<Self> {
        let (&first, rest) = payload
            .split_first()
            .ok_or_else(|| ChatError::Malformed("empty payload".to_string()))?;
        Self::decode_body(Opcode::try_from(first)?, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_layout() {
        let bytes = Request::Chat { peer: 3 }.encode();
        assert_eq!(bytes, vec![0x03, 0, 0, 0, 3]);
        assert_eq!(Request::decode(&bytes).unwrap(), Request::Chat { peer: 3 });
    }

    #[test]
    fn test_text_request_layout() {
        let req = Request::ChatResponse {
            peer: 1,
            data: b"hi".to_vec(),
        };
        let bytes = req.encode();
        assert_eq!(bytes, vec![0x07, 0, 0, 0, 1, 0, 0, 0, 2, b'h', b'i']);
        assert_eq!(Request::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn test_usrid_layout() {
        assert_eq!(ServerEvent::UserId(0).encode(), vec![0x09, 0, 0, 0, 0]);
    }

    #[test]
    fn test_online_list_layout() {
        let event = ServerEvent::OnlineUsers(vec![
            OnlineUser {
                id: 0,
                username: "alice".to_string(),
            },
            OnlineUser {
                id: 2,
                username: "charlie".to_string(),
            },
        ]);
        let bytes = event.encode();
        assert_eq!(&bytes[..5], &[0x02, 0, 0, 0, 2]);
        assert_eq!(ServerEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn test_proposal_decodes() {
        let event = ServerEvent::Proposal {
            from: 0,
            username: "alice".to_string(),
            public_key: b"-----BEGIN".to_vec(),
        };
        assert_eq!(ServerEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn test_truncated_request_rejected() {
        assert!(matches!(
            Request::decode(&[0x03, 0, 0]),
            Err(ChatError::Malformed(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert!(Request::decode(&[0x02, 0xFF]).is_err());
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            Request::decode(&[0x7F]),
            Err(ChatError::UnexpectedOpcode(0x7F))
        ));
    }

    #[test]
    fn test_oversized_data_rejected() {
        let mut bytes = vec![0x01, 0, 0, 0, 1];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Request::decode(&bytes),
            Err(ChatError::InvalidLength { field: "data", .. })
        ));
    }

    #[test]
    fn test_online_count_larger_than_payload() {
        let bytes = [0x02, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(ServerEvent::decode(&bytes).is_err());
    }

    #[test]
    fn test_empty_payload() {
        assert!(Request::decode(&[]).is_err());
        assert!(ServerEvent::decode(&[]).is_err());
    }
}
