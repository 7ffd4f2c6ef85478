//! Bench Server
//!
//! Owns the listener and the three long-running workers:
//!
//! - **acceptor**: accepts peers (1 s bounded wait), installs each as the
//!   current connection, queues the greeting and spawns a watcher
//! - **sender**: drains the outbound queue every 10 ms and writes frames to
//!   the current connection
//! - **receiver**: polls the current connection for complete frames and
//!   publishes them as events
//!
//! Every worker observes one `CancellationToken`. `stop` cancels it and
//! joins each worker with a timeout, so shutdown is bounded even if a task
//! misbehaves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::slot::{Connection, ConnectionSlot};
use super::TransportError;
use crate::events::{BenchEvent, EventSink};
use crate::messages::OutboundMessage;
use crate::queue::OutboundQueue;

/// Bounded wait of one accept attempt
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded wait of one dequeue attempt in the sender
const QUEUE_POLL: Duration = Duration::from_millis(10);

/// Readiness wait, and idle sleep when no peer is connected
const READ_POLL: Duration = Duration::from_millis(10);

/// How long `stop` waits for each worker
pub const JOIN_TIMEOUT: Duration = Duration::from_millis(1100);

/// Listen backlog; only one peer is served at a time
const LISTEN_BACKLOG: u32 = 1;

type Watchers = Arc<Mutex<Vec<JoinHandle<()>>>>;

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    watchers: Watchers,
}

/// TCP server serving one peer at a time
pub struct BenchServer {
    queue: Arc<OutboundQueue>,
    events: EventSink,
    slot: Arc<ConnectionSlot>,
    running: Mutex<Option<Running>>,
    /// Serializes `start` and `stop`
    lifecycle: tokio::sync::Mutex<()>,
}

impl BenchServer {
    /// Create a stopped server draining `queue` and reporting to `events`
    #[must_use]
    pub fn new(queue: Arc<OutboundQueue>, events: EventSink) -> Self {
        Self {
            queue,
            events,
            slot: Arc::new(ConnectionSlot::new()),
            running: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Whether the workers are running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Address the listener is bound to, while running
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// The slot holding the current peer
    #[must_use]
    pub fn slot(&self) -> &Arc<ConnectionSlot> {
        &self.slot
    }

    /// Bind `ip:port` and start the workers
    ///
    /// `port` is the operator's text; anything that is not a number in
    /// `0..=65535` fails before a socket is opened. Every failure is also
    /// published as a status event.
    pub async fn start(&self, ip: &str, port: &str) -> Result<SocketAddr, TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(TransportError::AlreadyRunning);
        }

        let result = self.bind(ip, port).await;
        let listener = match result {
            Ok(listener) => listener,
            Err(e) => {
                self.events.status(format!("server start failed: {e}"));
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let watchers: Watchers = Arc::new(Mutex::new(Vec::new()));

        let tasks = vec![
            (
                "acceptor",
                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&self.slot),
                    Arc::clone(&self.queue),
                    self.events.clone(),
                    cancel.clone(),
                    Arc::clone(&watchers),
                )),
            ),
            (
                "sender",
                tokio::spawn(send_loop(
                    Arc::clone(&self.queue),
                    Arc::clone(&self.slot),
                    self.events.clone(),
                    cancel.clone(),
                )),
            ),
            (
                "receiver",
                tokio::spawn(receive_loop(
                    Arc::clone(&self.slot),
                    self.events.clone(),
                    cancel.clone(),
                )),
            ),
        ];

        *self.running.lock() = Some(Running {
            local_addr,
            cancel,
            tasks,
            watchers,
        });

        info!(addr = %local_addr, "Bench server listening");
        self.events
            .status(format!("server started on {local_addr}, waiting for a client"));
        Ok(local_addr)
    }

    async fn bind(&self, ip: &str, port: &str) -> Result<TcpListener, TransportError> {
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| TransportError::InvalidPort(port.to_string()))?;

        let addr = tokio::net::lookup_host((ip.trim(), port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::InvalidAddress(format!("{ip}:{port}")))?;

        // Best-effort release of a lingering socket on the same address.
        if let Err(e) = new_socket(addr).and_then(|probe| probe.bind(addr)) {
            debug!(addr = %addr, error = %e, "Address probe failed");
            self.events.status(format!("address probe failed: {e}"));
        }

        new_socket(addr)
            .and_then(|socket| {
                socket.bind(addr)?;
                socket.listen(LISTEN_BACKLOG)
            })
            .map_err(|source| TransportError::Bind { addr, source })
    }

    /// Stop the workers and close every peer socket
    ///
    /// Each worker gets [`JOIN_TIMEOUT`]; one that does not finish in time
    /// is logged and aborted, and shutdown carries on.
    pub async fn stop(&self) -> Result<(), TransportError> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(running) = self.running.lock().take() else {
            return Err(TransportError::NotRunning);
        };

        running.cancel.cancel();
        for (task, handle) in running.tasks {
            join_with_timeout(task, handle).await;
        }

        let watchers = std::mem::take(&mut *running.watchers.lock());
        for handle in watchers {
            join_with_timeout("watcher", handle).await;
        }

        if let Some(conn) = self.slot.take() {
            conn.close().await;
        }

        info!(addr = %running.local_addr, "Bench server stopped");
        self.events.status("server stopped");
        Ok(())
    }
}

fn new_socket(addr: SocketAddr) -> std::io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    Ok(socket)
}

async fn join_with_timeout(task: &'static str, mut handle: JoinHandle<()>) {
    match tokio::time::timeout(JOIN_TIMEOUT, &mut handle).await {
        Ok(Ok(())) => debug!(task, "Worker finished"),
        Ok(Err(e)) => warn!(task, error = %e, "Worker ended abnormally"),
        Err(_) => {
            let error = TransportError::ShutdownJoinTimeout { task };
            warn!(task, error = %error, "Aborting worker");
            handle.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    slot: Arc<ConnectionSlot>,
    queue: Arc<OutboundQueue>,
    events: EventSink,
    cancel: CancellationToken,
    watchers: Watchers,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            result = tokio::time::timeout(ACCEPT_TIMEOUT, listener.accept()) => result,
        };

        let (stream, peer_addr) = match accepted {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(error = %e, "Accept failed");
                events.status(format!("accept failed: {e}"));
                continue;
            }
            Ok(Ok(accepted)) => accepted,
        };

        let conn = Arc::new(Connection::new(stream, peer_addr, cancel.child_token()));
        if let Some(previous) = slot.install(Arc::clone(&conn)) {
            info!(
                conn_id = %conn.id(),
                superseded = %previous.id(),
                "New peer supersedes the current one"
            );
        }
        info!(conn_id = %conn.id(), peer = %peer_addr, "Peer connected");
        events.status(format!("client connected: {peer_addr}"));

        match OutboundMessage::Greeting.to_json() {
            Ok(json) => queue.enqueue(json),
            Err(e) => warn!(conn_id = %conn.id(), error = %e, "Failed to serialize greeting"),
        }

        let handle = tokio::spawn(watch_connection(conn, Arc::clone(&slot)));
        let mut pending = watchers.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    debug!("Acceptor stopped");
}

/// Close a peer once it is closed elsewhere or the server shuts down
async fn watch_connection(conn: Arc<Connection>, slot: Arc<ConnectionSlot>) {
    conn.closed_token().cancelled().await;
    slot.clear_if(&conn);
    conn.close().await;
    debug!(conn_id = %conn.id(), "Connection released");
}

async fn send_loop(
    queue: Arc<OutboundQueue>,
    slot: Arc<ConnectionSlot>,
    events: EventSink,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let Some(json) = queue.dequeue_timeout(QUEUE_POLL).await else {
            continue;
        };
        let Some((conn, result)) = deliver(&slot, json.as_bytes()).await else {
            debug!(payload = %json, "No peer connected, message dropped");
            continue;
        };

        match result {
            Ok(()) => {
                info!(conn_id = %conn.id(), payload = %json, "Message sent");
                let bytes = json.len();
                events.sent(json);
                events.status(format!("message sent ({bytes} bytes)"));
            }
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "Send failed, dropping peer");
                slot.clear_if(&conn);
                conn.close().await;
                events.status(format!("send failed: {e}"));
            }
        }
    }

    debug!("Sender stopped");
}

/// Write `payload` to whichever peer is current when its writer is locked
///
/// A peer superseded while the sender waited for its writer is skipped and
/// the write goes to its successor. Returns `None` when no peer is left.
async fn deliver(
    slot: &ConnectionSlot,
    payload: &[u8],
) -> Option<(Arc<Connection>, Result<(), TransportError>)> {
    loop {
        let conn = slot.current()?;
        match conn.send_frame_if(payload, || slot.is_current(&conn)).await {
            Ok(Some(_)) => return Some((conn, Ok(()))),
            Ok(None) => debug!(conn_id = %conn.id(), "Peer superseded before write"),
            Err(e) => return Some((conn, Err(e))),
        }
    }
}

async fn receive_loop(slot: Arc<ConnectionSlot>, events: EventSink, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let Some(conn) = slot.current() else {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(READ_POLL) => {}
            }
            continue;
        };

        match conn.poll_frames(READ_POLL).await {
            Ok(frames) => {
                for payload in frames {
                    if let BenchEvent::Received(json) = events.received_payload(&payload) {
                        info!(conn_id = %conn.id(), payload = %json, "Message received");
                    }
                }
            }
            Err(TransportError::ConnectionClosed) => {
                info!(conn_id = %conn.id(), "Peer disconnected");
                if slot.clear_if(&conn) {
                    events.status(format!("client disconnected: {}", conn.peer_addr()));
                }
                conn.close().await;
            }
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "Receive failed, dropping peer");
                slot.clear_if(&conn);
                conn.close().await;
                events.status(format!("receive error: {e}"));
            }
        }
    }

    debug!("Receiver stopped");
}
