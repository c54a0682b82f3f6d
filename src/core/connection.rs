use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::cluster::NodeKey;
use crate::error::{Error, Result};
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::Frame;

/// A request/response channel to one cluster node.
///
/// Operations only ever see a connection through this trait, so tests and
/// alternative transports can substitute their own implementation.
#[async_trait]
pub trait Connection: Send + fmt::Debug {
    /// Writes one command frame and waits for its reply.
    ///
    /// Error replies (`-ERR ...`) are returned as `Ok(Frame::Error)`; only
    /// transport and framing problems are reported as `Err`.
    async fn send_command(&mut self, frame: &Frame) -> Result<Frame>;

    /// The node this connection talks to.
    fn address(&self) -> &NodeKey;
}

/// A RESP connection over any async byte stream.
///
/// This struct wraps an underlying stream and handles RESP frame encoding and
/// decoding, applying the configured read and write timeouts.
///
/// # Example
///
/// ```ignore
/// use slotmux::cluster::NodeKey;
/// use slotmux::core::connection::NodeConnection;
/// use slotmux::proto::Frame;
/// use tokio::net::TcpStream;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let node = NodeKey::parse("127.0.0.1:7000")?;
///     let stream = TcpStream::connect(node.as_str()).await?;
///     let mut conn = NodeConnection::new(stream, node);
///
///     conn.write_frame(&Frame::Array(vec![Frame::bulk("PING")])).await?;
///     let resp = conn.read_frame().await?;
///     println!("{:?}", resp);
///     Ok(())
/// }
/// ```
pub struct NodeConnection<S> {
    stream: S,
    address: NodeKey,
    decoder: Decoder,
    encoder: Encoder,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

/// A TCP connection to a cluster node.
pub type TcpConnection = NodeConnection<TcpStream>;

impl TcpConnection {
    /// Opens a TCP connection to `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if the connection is not established within
    /// `connect_timeout`, or `Error::Io` if it is refused.
    pub async fn connect(address: &NodeKey, connect_timeout: Duration) -> Result<Self> {
        let stream = with_timeout(Some(connect_timeout), "connect", async {
            let host = address.host().trim_start_matches('[').trim_end_matches(']');
            let stream = TcpStream::connect((host, address.port())).await?;
            stream.set_nodelay(true)?;
            Ok::<_, Error>(stream)
        })
        .await?;
        Ok(Self::new(stream, address.clone()))
    }
}

impl<S> NodeConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a new connection with the given stream and no timeouts.
    ///
    /// # Arguments
    ///
    /// * `stream` - The underlying async stream
    /// * `address` - The node on the other end
    pub fn new(stream: S, address: NodeKey) -> Self {
        Self {
            stream,
            address,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Configures read and write timeouts for this connection.
    ///
    /// # Returns
    ///
    /// Self for method chaining
    pub fn with_timeouts(
        mut self,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    /// Writes a frame to the connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if writing fails or `Error::Timeout` if the write
    /// timeout elapses.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        let stream = &mut self.stream;
        with_timeout(self.write_timeout, "write", async move {
            stream.write_all(&data).await?;
            stream.flush().await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Reads a frame from the connection.
    ///
    /// Handles partial reads internally and keeps reading until a complete
    /// frame is available.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if the peer closes the connection or sends
    /// malformed data, `Error::Timeout` if the read timeout elapses.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let decoder = &mut self.decoder;
        let stream = &mut self.stream;
        with_timeout(self.read_timeout, "read", async move {
            let mut buf = vec![0u8; 4096];
            loop {
                if let Some(frame) = decoder.decode()? {
                    return Ok(frame);
                }
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    return Err(Error::protocol("connection closed"));
                }
                decoder.append(&buf[..n]);
            }
        })
        .await
    }
}

#[async_trait]
impl<S> Connection for NodeConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug,
{
    async fn send_command(&mut self, frame: &Frame) -> Result<Frame> {
        self.write_frame(frame).await?;
        self.read_frame().await
    }

    fn address(&self) -> &NodeKey {
        &self.address
    }
}

impl<S> fmt::Debug for NodeConnection<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeConnection")
            .field("stream", &self.stream)
            .field("address", &self.address)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(after) => tokio::time::timeout(after, fut)
            .await
            .map_err(|_| Error::Timeout { operation, after })?,
        None => fut.await,
    }
}
