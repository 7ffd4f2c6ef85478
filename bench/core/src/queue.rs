//! Outbound Queue
//!
//! Unbounded FIFO of serialized JSON payloads waiting for the sender loop.
//!
//! Producers (operator commands, schedulers, the acceptor's greeting) call
//! [`OutboundQueue::enqueue`] from any thread without blocking. The sender
//! loop is the single consumer and drains with a bounded wait so it can
//! notice shutdown.
//!
//! The queue outlives server restarts: anything enqueued while no peer is
//! connected is drained and dropped by the sender.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// Thread-safe FIFO of pending outbound JSON payloads
#[derive(Debug)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    pending: AtomicUsize,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
        }
    }

    /// Append a payload. Never blocks.
    pub fn enqueue(&self, json: String) {
        // Counted before the send so a racing consumer never underflows.
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(json).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Wait up to `timeout` for the next payload
    ///
    /// Returns `None` when nothing arrived in time.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(json)) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Some(json)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Take the next payload if one is immediately available
    ///
    /// Returns `None` when the queue is empty or the consumer side is busy.
    pub fn try_dequeue(&self) -> Option<String> {
        let mut rx = self.rx.try_lock().ok()?;
        let json = rx.try_recv().ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(json)
    }

    /// Number of payloads waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether no payload is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
