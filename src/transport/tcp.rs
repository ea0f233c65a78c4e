//! TCP connections and listener, using tokio for async I/O.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};

use crate::error::{ChatError, ChatResult};
use crate::transport::write_all_flush;

/// Buffered read half of a connection.
pub type ConnectionReader<S> = BufReader<ReadHalf<S>>;

/// Buffered write half of a connection.
pub type ConnectionWriter<S> = BufWriter<WriteHalf<S>>;

/// A full-duplex byte stream split into buffered halves.
///
/// Generic over the stream so the protocol can run over TCP in production
/// and over in-memory pipes in tests.
pub struct Connection<S> {
    reader: ConnectionReader<S>,
    writer: ConnectionWriter<S>,
    peer_addr: String,
}

/// A connection over TCP.
pub type TcpConnection = Connection<TcpStream>;

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    /// Wraps a stream.
    pub fn new(stream: S, peer_addr: impl Into<String>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            peer_addr: peer_addr.into(),
        }
    }

    /// Peer address as a string.
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Read half.
    pub fn reader(&mut self) -> &mut ConnectionReader<S> {
        &mut self.reader
    }

    /// Write half.
    pub fn writer(&mut self) -> &mut ConnectionWriter<S> {
        &mut self.writer
    }

    /// Writes raw bytes and flushes.
    pub async fn send_raw(&mut self, data: &[u8]) -> ChatResult<()> {
        write_all_flush(&mut self.writer, data).await
    }

    /// Separates the halves so they can be driven from different tasks.
    pub fn into_split(self) -> (ConnectionReader<S>, ConnectionWriter<S>) {
        (self.reader, self.writer)
    }

    /// Flushes and shuts down the write side.
    pub async fn close(&mut self) -> ChatResult<()> {
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

impl TcpConnection {
    /// Creates a connection from an accepted or connected stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(stream, peer_addr)
    }

    /// Connect to a remote address.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> ChatResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }
}

/// TCP listener for accepting chat connections.
pub struct TcpListener {
    listener: TokioTcpListener,
}

impl TcpListener {
    /// Bind to an address and start listening.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> ChatResult<Self> {
        let listener = TokioTcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept a new connection.
    pub async fn accept(&self) -> ChatResult<TcpConnection> {
        let (stream, _addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::from_stream(stream))
    }

    /// Get the local address.
    pub fn local_addr(&self) -> ChatResult<std::net::SocketAddr> {
        self.listener.local_addr().map_err(ChatError::IoError)
    }
}
