//! Transport Layer
//!
//! TCP plumbing between the bench and its single peer:
//!
//! ```text
//!             ┌──────────┐  install   ┌────────────────┐
//!  listener ─►│ acceptor │──────────► │ ConnectionSlot │
//!             └──────────┘            └───────┬────────┘
//!                                             │ current peer
//!          OutboundQueue ─► sender ───────────┤
//!                                             │
//!          events ◄───────── receiver ◄───────┘
//! ```
//!
//! - `frame`: 5-byte header codec and streaming decoder
//! - `slot`: the single active connection and its id
//! - `server`: acceptor, sender and receiver tasks with start/stop

pub mod frame;
pub mod server;
pub mod slot;

use std::net::SocketAddr;

use thiserror::Error;

pub use frame::{FrameDecoder, HEADER_SIZE, MAX_INBOUND_FRAME_SIZE};
pub use server::BenchServer;
pub use slot::{Connection, ConnectionId, ConnectionSlot};

/// Errors raised by framing, the socket and server lifecycle
#[derive(Debug, Error)]
pub enum TransportError {
    /// Payload length does not fit the 32-bit header field
    #[error("Payload of {len} bytes exceeds the frame length field")]
    PayloadTooLarge {
        /// Offending payload length
        len: usize,
    },

    /// Inbound header announces a payload over the receive cap
    #[error("Inbound frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced payload length
        len: usize,
        /// Receive cap
        max: usize,
    },

    /// Peer closed the stream, possibly mid-frame
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Port text is not a number in 0..=65535
    #[error("Invalid port: {0:?}")]
    InvalidPort(String),

    /// Address could not be resolved
    #[error("Cannot resolve address {0}")]
    InvalidAddress(String),

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// `start` called while the server runs
    #[error("Server already running")]
    AlreadyRunning,

    /// `stop` called while the server is stopped
    #[error("Server not running")]
    NotRunning,

    /// A worker task did not finish within the join timeout
    #[error("Timed out waiting for {task} task to finish")]
    ShutdownJoinTimeout {
        /// Name of the worker
        task: &'static str,
    },

    /// Other socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
