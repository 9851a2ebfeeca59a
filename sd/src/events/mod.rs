//! Event system for the sync daemon
//!
//! Components emit typed events onto a broadcast bus; consumers (the JSONL
//! activity log, tests) subscribe. Fire-and-forget: lagging or absent
//! subscribers never block the orchestrator.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, create_event_bus};
pub use logger::{EventLogEntry, spawn_event_logger};
pub use types::SyncEvent;
