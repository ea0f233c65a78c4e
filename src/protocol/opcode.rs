//! One-byte application opcodes.

use std::fmt;

use crate::error::ChatError;

/// First byte of every decrypted application payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Opaque control bytes relayed between chat peers.
    Auth = 0x01,
    /// Request or reply carrying the online user list.
    Online = 0x02,
    /// Chat proposal.
    Chat = 0x03,
    /// Proposal accepted.
    ChatPos = 0x04,
    /// Proposal refused, or the peer cannot chat.
    ChatNeg = 0x05,
    /// Chat ended by one side.
    StopChat = 0x06,
    /// Chat text relayed between peers.
    ChatResponse = 0x07,
    /// Client is leaving.
    Exit = 0x08,
    /// First frame after the handshake, carries the user id.
    UsrId = 0x09,
}

impl Opcode {
    /// Wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short uppercase name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Auth => "AUTH",
            Opcode::Online => "ONLINE",
            Opcode::Chat => "CHAT",
            Opcode::ChatPos => "CHAT_POS",
            Opcode::ChatNeg => "CHAT_NEG",
            Opcode::StopChat => "STOP_CHAT",
            Opcode::ChatResponse => "CHAT_RESPONSE",
            Opcode::Exit => "EXIT",
            Opcode::UsrId => "USRID",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ChatError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Opcode::Auth,
            0x02 => Opcode::Online,
            0x03 => Opcode::Chat,
            0x04 => Opcode::ChatPos,
            0x05 => Opcode::ChatNeg,
            0x06 => Opcode::StopChat,
            0x07 => Opcode::ChatResponse,
            0x08 => Opcode::Exit,
            0x09 => Opcode::UsrId,
            other => return Err(ChatError::UnexpectedOpcode(other)),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op.as_u8()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
