//! Byte-stream transport and bounded wire helpers.
//!
//! All multi-byte integers on the wire are big-endian. Variable-size fields
//! are preceded by a 4-byte length that is checked against a per-field bound
//! before anything is allocated.

mod tcp;

pub use tcp::{Connection, ConnectionReader, ConnectionWriter, TcpConnection, TcpListener};

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChatError, ChatResult};

fn map_read_error(e: std::io::Error) -> ChatError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ChatError::ConnectionClosed
    } else {
        ChatError::IoError(e)
    }
}

/// Reads exactly `N` bytes.
pub async fn read_array<const N: usize, R: AsyncRead + Unpin>(reader: &mut R) -> ChatResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await.map_err(map_read_error)?;
    Ok(buf)
}

/// Reads a big-endian `u32`.
pub async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> ChatResult<u32> {
    Ok(u32::from_be_bytes(read_array::<4, _>(reader).await?))
}

/// Reads exactly `len` bytes into a new buffer.
pub async fn read_exact_vec<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> ChatResult<Vec<u8>> {
    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(map_read_error)?;
    Ok(data)
}

/// Reads a length-prefixed field, rejecting lengths above `max`.
pub async fn read_field<R: AsyncRead + Unpin>(
    reader: &mut R,
    field: &'static str,
    max: usize,
) -> ChatResult<Vec<u8>> {
    let len = read_u32(reader).await? as usize;
    if len > max {
        return Err(ChatError::InvalidLength { field, len, max });
    }
    read_exact_vec(reader, len).await
}

/// Writes all bytes and flushes.
pub async fn write_all_flush<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> ChatResult<()> {
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Appends `len(data) ‖ data` to `buf`.
pub fn put_field<B: BufMut>(buf: &mut B, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Cursor over a decrypted payload with bounded field extraction.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    /// Starts reading at the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Reads a big-endian `u32`.
    pub fn u32(&mut self, field: &'static str) -> ChatResult<u32> {
        if self.buf.remaining() < 4 {
            return Err(ChatError::Malformed(format!("truncated {}", field)));
        }
        Ok(self.buf.get_u32())
    }

    /// Reads a length-prefixed field bounded by `max`.
    pub fn field(&mut self, field: &'static str, max: usize) -> ChatResult<&'a [u8]> {
        let len = self.u32(field)? as usize;
        if len > max || len > self.buf.len() {
            return Err(ChatError::InvalidLength {
                field,
                len,
                max: max.min(self.buf.len()),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a length-prefixed UTF-8 string bounded by `max`.
    pub fn string(&mut self, field: &'static str, max: usize) -> ChatResult<String> {
        let bytes = self.field(field, max)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ChatError::Malformed(format!("{} is not UTF-8", field)))
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> ChatResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ChatError::Malformed(format!(
                "{} trailing bytes",
                self.buf.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_field_within_bound() {
        let mut buf = Vec::new();
        put_field(&mut buf, b"alice");
        let mut reader = buf.as_slice();

        let field = read_field(&mut reader, "username", 32).await.unwrap();
        assert_eq!(field, b"alice");
    }

    #[tokio::test]
    async fn test_read_field_rejects_oversize_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut reader = buf.as_slice();

        let result = read_field(&mut reader, "username", 32).await;
        assert!(matches!(
            result,
            Err(ChatError::InvalidLength { field: "username", .. })
        ));
    }

    #[tokio::test]
    async fn test_short_read_is_connection_closed() {
        let mut reader: &[u8] = &[0, 0, 0, 8, 1, 2];
        let result = read_field(&mut reader, "cert", 64).await;
        assert!(matches!(result, Err(ChatError::ConnectionClosed)));
    }

    #[test]
    fn test_payload_reader() {
        let mut buf = Vec::new();
        buf.put_u32(7);
        put_field(&mut buf, b"bob");

        let mut reader = PayloadReader::new(&buf);
        assert_eq!(reader.u32("id").unwrap(), 7);
        assert_eq!(reader.string("name", 32).unwrap(), "bob");
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_payload_reader_field_past_end() {
        let mut buf = Vec::new();
        buf.put_u32(10);
        buf.put_slice(b"abc");

        let mut reader = PayloadReader::new(&buf);
        assert!(matches!(
            reader.field("text", 1024),
            Err(ChatError::InvalidLength { len: 10, .. })
        ));
    }

    #[test]
    fn test_payload_reader_trailing_bytes() {
        let reader = PayloadReader::new(&[1, 2]);
        assert!(reader.finish().is_err());
    }
}
