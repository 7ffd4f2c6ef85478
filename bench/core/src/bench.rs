//! Bench
//!
//! The facade a front end drives. It owns the shared pieces and wires them
//! together once:
//!
//! ```text
//!            ┌───────────── Bench ─────────────┐
//! operator ─►│ DiffEngine ─► OutboundQueue ─┐  │
//!            │     ▲                        ▼  │
//!            │ Scheduler              BenchServer ◄─► peer
//!            │                              │  │
//!            │           EventSink ◄────────┘  │
//!            └─────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::attributes::{arm_label, attribute, Selection};
use crate::config::{BenchConfig, ConfigError};
use crate::diff::DiffEngine;
use crate::events::{BenchEvent, EventSink};
use crate::messages::DiffReport;
use crate::queue::OutboundQueue;
use crate::scheduler::Scheduler;
use crate::state::{ArmStateStore, StateError};
use crate::transport::{BenchServer, TransportError};

/// Test bench: arm state, diffing, schedulers and the TCP server
pub struct Bench {
    store: Arc<ArmStateStore>,
    queue: Arc<OutboundQueue>,
    events: EventSink,
    engine: DiffEngine,
    server: BenchServer,
    scheduler: Scheduler,
}

impl Default for Bench {
    fn default() -> Self {
        Self::new()
    }
}

impl Bench {
    /// Create a bench with every arm at its initial state and the server stopped
    #[must_use]
    pub fn new() -> Self {
        let store = Arc::new(ArmStateStore::new());
        let queue = Arc::new(OutboundQueue::new());
        let events = EventSink::new();
        let engine = DiffEngine::new(Arc::clone(&store), Arc::clone(&queue));
        let server = BenchServer::new(Arc::clone(&queue), events.clone());
        let scheduler = Scheduler::new(engine.clone(), events.clone());

        Self {
            store,
            queue,
            events,
            engine,
            server,
            scheduler,
        }
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BenchEvent> {
        self.events.subscribe()
    }

    /// The event sink
    #[must_use]
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Per-arm state
    #[must_use]
    pub fn store(&self) -> &Arc<ArmStateStore> {
        &self.store
    }

    /// Payloads waiting for the sender
    #[must_use]
    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// The TCP server
    #[must_use]
    pub fn server(&self) -> &BenchServer {
        &self.server
    }

    /// Auto-send and swap-pedal-auto
    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start serving on `ip:port`
    pub async fn start(&self, ip: &str, port: &str) -> Result<SocketAddr, TransportError> {
        self.server.start(ip, port).await
    }

    /// Stop the server; schedulers keep running
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.server.stop().await
    }

    /// Stop schedulers and, if running, the server
    pub async fn shutdown(&self) {
        self.scheduler.stop_all().await;
        if self.server.is_running() {
            if let Err(e) = self.server.stop().await {
                tracing::warn!(error = %e, "Server stop during shutdown failed");
            }
        }
        info!("Bench shut down");
    }

    /// Set an attribute's selection from operator text and its enabled flag
    ///
    /// `value` is `change`, `random`, or one of the attribute's real values.
    pub fn set_attribute_selection(
        &self,
        arm: usize,
        attribute_name: &str,
        value: &str,
        enabled: bool,
    ) -> Result<Selection, StateError> {
        let (_, attr) = attribute(attribute_name)?;
        let selection = Selection::parse(attr, value)?;
        self.store
            .set_attribute_selection(arm, attr.name(), selection, enabled)?;
        tracing::debug!(
            arm = %arm_label(arm),
            attribute = attr.name(),
            selection = selection.label(attr),
            enabled,
            "Selection updated"
        );
        Ok(selection)
    }

    /// Enable or disable an attribute, keeping its selection
    pub fn set_enabled(
        &self,
        arm: usize,
        attribute_name: &str,
        enabled: bool,
    ) -> Result<(), StateError> {
        self.store.set_enabled(arm, attribute_name, enabled)
    }

    /// Diff one arm and queue the report, if any
    pub fn send_arm_state(&self, arm: usize) -> Result<Option<DiffReport>, StateError> {
        self.engine.send_arm_state(arm)
    }

    /// Exchange `is_selected` between arm 1 and arm 2 and queue both diffs
    pub fn swap_pedal(&self) -> Result<(Option<DiffReport>, Option<DiffReport>), StateError> {
        self.engine.swap_pedal()
    }

    /// Apply the scheduler interval and enable the configured selections
    pub fn apply_config(&self, config: &BenchConfig) -> Result<(), ConfigError> {
        self.scheduler.set_interval(config.interval);
        for resolved in config.resolved_selections()? {
            self.store
                .set_attribute_selection(resolved.arm, resolved.attribute, resolved.selection, true)
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        Ok(())
    }
}
