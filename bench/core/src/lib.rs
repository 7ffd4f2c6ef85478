//! Armbench Core - Arm Telemetry Test Bench
//!
//! A TCP test bench that plays the device side of a multi-arm telemetry
//! link. An operator (or a scheduler) picks how each arm attribute should
//! change; the bench diffs every arm against what it last sent and writes
//! only the changes to a single peer as length-prefixed JSON frames.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Front end (daemon / UI)                  │
//! │   set selection · send arm · swap pedal · start · stop       │
//! └──────────────┬─────────────────────────────────▲─────────────┘
//!                │                                 │ BenchEvent
//! ┌──────────────┼─────────────────────────────────┼─────────────┐
//! │              ▼           ARMBENCH CORE         │             │
//! │  ┌────────────────┐   ┌────────────┐   ┌───────┴─────────┐   │
//! │  │ ArmStateStore  │◄──│ DiffEngine │◄──│    Scheduler    │   │
//! │  └────────────────┘   └─────┬──────┘   └─────────────────┘   │
//! │                             ▼                                │
//! │                     ┌───────────────┐                        │
//! │                     │ OutboundQueue │                        │
//! │                     └───────┬───────┘                        │
//! │                             ▼                                │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │ BenchServer: acceptor · sender · receiver · slot     │    │
//! │  └──────────────────────────┬───────────────────────────┘    │
//! └─────────────────────────────┼────────────────────────────────┘
//!                               ▼
//!                      one TCP peer at a time
//! ```
//!
//! # Module Overview
//!
//! - [`attributes`]: the attribute catalog and selection modes
//! - [`state`]: per-arm selection, enabled flag and last emitted value
//! - [`diff`]: change-set computation and the swap pedal
//! - [`messages`]: greeting and diff report JSON
//! - [`queue`]: outbound payload FIFO
//! - [`transport`]: framing, the connection slot and the server workers
//! - [`scheduler`]: auto-send and swap-pedal-auto
//! - [`events`]: status, sent and received notifications
//! - [`config`]: layered TOML / env / CLI configuration
//! - [`bench`]: the facade tying it together

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod attributes;
pub mod bench;
pub mod config;
pub mod diff;
pub mod events;
pub mod messages;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use attributes::{arm_label, Attribute, Selection, ATTRIBUTES, IS_SELECTED, NUM_ARMS};
pub use bench::Bench;
pub use diff::DiffEngine;
pub use events::{BenchEvent, EventSink, MALFORMED_PREFIX};
pub use messages::{DiffReport, OutboundMessage};
pub use queue::OutboundQueue;
pub use scheduler::{Scheduler, SchedulerError, DEFAULT_INTERVAL};
pub use state::{ArmState, ArmStateStore, AttributeState, StateError};
pub use transport::{BenchServer, ConnectionId, TransportError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_env, BenchConfig,
    BenchToml, ConfigError, ConfigOverrides, ConfigSource, SelectionSpec,
};
