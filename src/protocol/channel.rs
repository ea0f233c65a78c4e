//! Authenticated, sequenced framing over an established session key.
//!
//! ## Frame layout
//!
//! ```text
//! +-----------+----------+-----------+------------------+
//! | aadLen(4) | IV (12)  | TAG (16)  | CT (aadLen)      |
//! +-----------+----------+-----------+------------------+
//! ```
//!
//! The plaintext is `seq_be32 ‖ payload` and the 4-byte `aadLen` field is the
//! associated data, so changing the length invalidates the tag.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use crate::crypto::{aead, SessionKey};
use crate::error::{ChatError, ChatResult};
use crate::transport::{read_array, read_exact_vec, write_all_flush};
use crate::{FRAME_HEADER_LEN, IV_LEN, SEQ_LEN, TAG_LEN};

/// A frame as read from the wire, not yet authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// `aadLen ‖ IV ‖ TAG`.
    pub header: [u8; FRAME_HEADER_LEN],
    /// Ciphertext, `aadLen` bytes.
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Declared ciphertext length.
    pub fn declared_len(&self) -> u32 {
        u32::from_be_bytes([self.header[0], self.header[1], self.header[2], self.header[3]])
    }

    /// Full wire encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

/// Reads one frame, bound-checking the declared length before reading the body.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_len: usize,
) -> ChatResult<RawFrame> {
    let header = read_array::<FRAME_HEADER_LEN, _>(reader).await?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len < SEQ_LEN || len > max_frame_len {
        return Err(ChatError::InvalidLength {
            field: "frame",
            len,
            max: max_frame_len,
        });
    }
    let body = read_exact_vec(reader, len).await?;
    Ok(RawFrame { header, body })
}

/// Per-connection encryption state.
///
/// Both counters start at zero. `send_seq` is never reused: when it would
/// wrap, sending fails with [`ChatError::SequenceExhausted`].
pub struct SecureChannel {
    key: SessionKey,
    send_seq: u32,
    recv_seq: u32,
    max_frame_len: usize,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("max_frame_len", &self.max_frame_len)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Starts a channel with both counters at zero.
    pub fn new(key: SessionKey, max_frame_len: usize) -> Self {
        Self::with_sequences(key, 0, 0, max_frame_len)
    }

    /// Starts a channel at explicit counter values.
    pub fn with_sequences(key: SessionKey, send_seq: u32, recv_seq: u32, max_frame_len: usize) -> Self {
        Self {
            key,
            send_seq,
            recv_seq,
            max_frame_len,
        }
    }

    /// Next sequence number to be sent.
    pub fn send_seq(&self) -> u32 {
        self.send_seq
    }

    /// Lowest sequence number still acceptable.
    pub fn recv_seq(&self) -> u32 {
        self.recv_seq
    }

    /// Encrypts `payload` into a wire frame and advances `send_seq`.
    pub fn seal_frame(&mut self, payload: &[u8]) -> ChatResult<Vec<u8>> {
        let seq = self.send_seq;
        let next = seq.checked_add(1).ok_or(ChatError::SequenceExhausted)?;

        let plain_len = SEQ_LEN + payload.len();
        if plain_len > self.max_frame_len {
            return Err(ChatError::InvalidLength {
                field: "frame",
                len: plain_len,
                max: self.max_frame_len,
            });
        }

        let mut plaintext = Vec::with_capacity(plain_len);
        plaintext.extend_from_slice(&seq.to_be_bytes());
        plaintext.extend_from_slice(payload);

        let aad = (plain_len as u32).to_be_bytes();
        let sealed = aead::seal(&self.key, &aad, &plaintext)
            .map_err(|_| ChatError::AuthenticationFailed)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + plain_len);
        frame.extend_from_slice(&aad);
        frame.extend_from_slice(&sealed.iv);
        frame.extend_from_slice(&sealed.tag);
        frame.extend_from_slice(&sealed.ciphertext);

        self.send_seq = next;
        trace!(seq, len = plain_len, "sealed frame");
        Ok(frame)
    }

    /// Authenticates and decrypts a frame, enforcing sequence order.
    pub fn open_frame(&mut self, frame: &RawFrame) -> ChatResult<Vec<u8>> {
        let len = frame.declared_len() as usize;
        if len != frame.body.len() || len < SEQ_LEN || len > self.max_frame_len {
            return Err(ChatError::InvalidLength {
                field: "frame",
                len,
                max: self.max_frame_len,
            });
        }

        let aad = &frame.header[..4];
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&frame.header[4..4 + IV_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&frame.header[4 + IV_LEN..]);

        let plaintext = aead::open(&self.key, aad, &iv, &tag, &frame.body)
            .map_err(|_| ChatError::AuthenticationFailed)?;

        let seq = u32::from_be_bytes([plaintext[0], plaintext[1], plaintext[2], plaintext[3]]);
        if seq < self.recv_seq {
            return Err(ChatError::Replay {
                expected: self.recv_seq,
                got: seq,
            });
        }
        // Forward gaps are accepted; only going backwards is a replay.
        self.recv_seq = seq.checked_add(1).ok_or(ChatError::SequenceExhausted)?;
        trace!(seq, len, "opened frame");

        Ok(plaintext[SEQ_LEN..].to_vec())
    }

    /// Seals `payload` and writes it.
    pub async fn send<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, payload: &[u8]) -> ChatResult<()> {
        let frame = self.seal_frame(payload)?;
        write_all_flush(writer, &frame).await
    }

    /// Reads and opens the next frame.
    pub async fn recv<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> ChatResult<Vec<u8>> {
        let frame = read_frame(reader, self.max_frame_len).await?;
        self.open_frame(&frame)
    }
}
