//! State management for the sync daemon
//!
//! A single actor owns the jobstore; everything else talks to it through a
//! cloneable handle. One writer per process keeps record transitions
//! linearisable and the status document free of write races.

mod manager;
mod messages;

pub use manager::{StateEvent, StateManager};
pub use messages::{StateCommand, StateError, StateResponse, TransitionPatch};
