//! Connection Slot
//!
//! Holds at most one active peer. Installing a new peer supersedes the old
//! one without closing it; a superseded socket stays open until its watcher
//! closes it at shutdown.

use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::frame::{self, FrameDecoder};
use super::TransportError;

/// Read buffer size for one `try_read` call
const READ_CHUNK: usize = 4096;

/// Unique identifier for an accepted peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    #[must_use]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug)]
struct ReadState {
    half: OwnedReadHalf,
    decoder: FrameDecoder,
}

/// One accepted peer socket
///
/// Reader and writer halves are locked independently, so the sender and
/// receiver never wait on each other.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    reader: tokio::sync::Mutex<ReadState>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl Connection {
    /// Wrap an accepted stream
    ///
    /// `closed` is cancelled when the connection is closed; pass a child of
    /// the server token so shutdown closes it too.
    #[must_use]
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, closed: CancellationToken) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id: ConnectionId::new(),
            peer_addr,
            reader: tokio::sync::Mutex::new(ReadState {
                half: read_half,
                decoder: FrameDecoder::new(),
            }),
            writer: tokio::sync::Mutex::new(write_half),
            closed,
        }
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the peer
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Token cancelled once the connection is closed
    #[must_use]
    pub fn closed_token(&self) -> &CancellationToken {
        &self.closed
    }

    /// Whether [`close`](Self::close) has run or the server shut down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write one complete frame carrying `payload`
    pub async fn send_frame(&self, payload: &[u8]) -> Result<usize, TransportError> {
        self.send_frame_if(payload, || true)
            .await
            .map(|written| written.unwrap_or_default())
    }

    /// Write one frame only if `still_wanted` holds once the writer is locked
    ///
    /// Returns `Ok(None)` without writing when it does not.
    pub async fn send_frame_if<F>(
        &self,
        payload: &[u8],
        still_wanted: F,
    ) -> Result<Option<usize>, TransportError>
    where
        F: FnOnce() -> bool,
    {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        if !still_wanted() {
            return Ok(None);
        }
        frame::write_frame(&mut *writer, payload).await?;
        Ok(Some(frame::HEADER_SIZE + payload.len()))
    }

    /// Wait up to `wait` for readability, then drain every available byte
    ///
    /// Returns the payloads of all complete frames, possibly none. A partial
    /// frame stays buffered for the next call. End of stream with nothing
    /// left to decode is `TransportError::ConnectionClosed`; a header over
    /// [`MAX_INBOUND_FRAME_SIZE`](frame::MAX_INBOUND_FRAME_SIZE) is
    /// `TransportError::FrameTooLarge`.
    pub async fn poll_frames(&self, wait: Duration) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut guard = self.reader.lock().await;
        let state = &mut *guard;

        match tokio::time::timeout(wait, state.half.readable()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(ready) => ready?,
        }

        let mut buf = [0u8; READ_CHUNK];
        let mut frames = Vec::new();
        let mut eof = false;
        loop {
            match state.half.try_read(&mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    state.decoder.push(&buf[..n]);
                    // Decode as we go so an oversized header is refused
                    // before its payload is buffered.
                    while let Some(payload) = state.decoder.decode_next()? {
                        frames.push(payload);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if eof && frames.is_empty() {
            if state.decoder.available() > 0 {
                debug!(
                    conn_id = %self.id,
                    bytes = state.decoder.available(),
                    "Peer closed mid-frame"
                );
            }
            return Err(TransportError::ConnectionClosed);
        }
        Ok(frames)
    }

    /// Shut down the write side and mark the connection closed
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(conn_id = %self.id, error = %e, "Shutdown of closed socket");
        }
    }
}

/// The single active connection
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    current: Mutex<Option<Arc<Connection>>>,
}

impl ConnectionSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` current, returning the superseded connection (left open)
    pub fn install(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.current.lock().replace(conn)
    }

    /// The current connection, if any
    #[must_use]
    pub fn current(&self) -> Option<Arc<Connection>> {
        self.current.lock().clone()
    }

    /// Clear the slot only if it still holds `conn`
    ///
    /// Returns whether the slot was cleared.
    pub fn clear_if(&self, conn: &Arc<Connection>) -> bool {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Whether `conn` is the current connection
    #[must_use]
    pub fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, conn))
    }

    /// Remove and return the current connection
    pub fn take(&self) -> Option<Arc<Connection>> {
        self.current.lock().take()
    }

    /// Whether a connection is current
    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.current.lock().is_some()
    }
}
