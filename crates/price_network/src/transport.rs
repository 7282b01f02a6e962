//! TCP transport: listening, dialing and newline-framed peer connections.
//!
//! A socket is split into a read half, consumed by the connection's read
//! loop as a stream of raw frames, and a write half wrapped in a cloneable
//! [`PeerConnection`] handle that any task can send through.
//!
//! Frames are split on `\n` as bytes; turning them into text is left to the
//! reader, so a frame that is not valid UTF-8 costs one message, not the
//! connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::NetworkError;

/// Size of the per-connection read buffer.
pub const READ_BUFFER_SIZE: usize = 4096;

/// How long one send may take before the peer is treated as dead.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Type-erased write half, so tests can stand in any writer for a socket.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream of newline-terminated frames read from a peer, as raw bytes.
pub type FrameReader<R = OwnedReadHalf> = FramedRead<R, AnyDelimiterCodec>;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to the write side of one peer socket.
///
/// Clones share the same writer; sends are serialized so frames from
/// concurrent senders never interleave. Cancelling the token tells the
/// connection's read loop to stop.
#[derive(Clone)]
pub struct PeerConnection {
    conn_id: u64,
    sink: Arc<Mutex<FramedWrite<BoxedWriter, LinesCodec>>>,
    token: CancellationToken,
    write_timeout: Duration,
}

impl PeerConnection {
    /// Wrap a writer. `token` governs the lifetime of the whole connection.
    pub fn new(writer: BoxedWriter, token: CancellationToken) -> Self {
        Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            sink: Arc::new(Mutex::new(FramedWrite::new(writer, LinesCodec::new()))),
            token,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound each send, including the wait for concurrent senders.
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Process-unique id of the underlying socket.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Write one frame and flush it. Gives up as soon as the connection is
    /// closed, even if the peer has stopped reading.
    ///
    /// A send that outlasts the write timeout closes the connection and
    /// fails with [`NetworkError::Timeout`].
    pub async fn send_frame(&self, frame: &str) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Transport("Connection closed".to_string()));
        }
        let send = async {
            let mut sink = self.sink.lock().await;
            sink.send(frame)
                .await
                .map_err(|e| NetworkError::Transport(format!("Send error: {e}")))
        };
        let result = tokio::select! {
            _ = self.token.cancelled() => {
                Err(NetworkError::Transport("Connection closed".to_string()))
            }
            sent = tokio::time::timeout(self.write_timeout, send) => {
                sent.unwrap_or(Err(NetworkError::Timeout(self.write_timeout)))
            }
        };
        if let Err(NetworkError::Timeout(after)) = &result {
            warn!("Send on connection {} stalled for {after:?}, closing it", self.conn_id);
            self.token.cancel();
        }
        result
    }

    /// Stop the read loop and shut down the write half.
    ///
    /// If another task is mid-send the shutdown is skipped; the socket is
    /// released once the last handle drops. Flushing what is left is bounded
    /// by the write timeout.
    pub async fn close(&self) {
        self.token.cancel();
        if let Ok(mut sink) = self.sink.try_lock() {
            let _ = tokio::time::timeout(self.write_timeout, SinkExt::<&str>::close(&mut *sink)).await;
        }
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("conn_id", &self.conn_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Frame reader over any byte source, with a bounded frame length.
pub fn frame_reader<R: AsyncRead>(reader: R, max_frame_len: usize) -> FrameReader<R> {
    FramedRead::with_capacity(
        reader,
        AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_frame_len),
        READ_BUFFER_SIZE,
    )
}

/// Split a connected socket into its frame reader and write handle.
pub fn split_stream(
    stream: TcpStream,
    max_frame_len: usize,
    write_timeout: Duration,
    token: CancellationToken,
) -> (PeerConnection, FrameReader) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    let (read_half, write_half) = stream.into_split();
    let conn = PeerConnection::new(Box::new(write_half), token).with_write_timeout(write_timeout);
    (conn, frame_reader(read_half, max_frame_len))
}

/// Bind the listening socket.
pub async fn bind(host: &str, port: u16) -> Result<TcpListener, NetworkError> {
    TcpListener::bind((host, port))
        .await
        .map_err(|e| NetworkError::Transport(format!("Bind {host}:{port} failed: {e}")))
}

/// Dial a remote node. No timeout beyond the OS connect timeout.
pub async fn dial(host: &str, port: u16) -> Result<TcpStream, NetworkError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|e| NetworkError::Transport(format!("Connect to {host}:{port} failed: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
