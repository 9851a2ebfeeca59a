//! IPC message types for daemon control

use serde::{Deserialize, Serialize};

use crate::domain::JobRecord;
use crate::status::ListStatusView;

/// Requests from CLI/controllers to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Check if the daemon is alive
    Ping,

    /// Project the full cycled-list status document
    Status,

    /// Start the cycled list
    StartList,

    /// Stop the cycled list
    StopList { reason: String },

    /// Pause the cycled list (user-initiated)
    Pause { reason: Option<String> },

    /// Resume a paused cycled list
    Resume,

    /// Run a single job out of cycle
    RunJob { name: String },

    /// List job records, optionally filtered by name
    ListRecords {
        name: Option<String>,
        limit: Option<usize>,
    },

    /// Delete one job record
    DeleteRecord { id: String },

    /// Delete every job record
    PruneRecords,

    /// Stop the daemon process
    Shutdown,
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Acknowledgment
    Ok,

    /// Ping response
    Pong { version: String },

    /// Status projection
    Status { view: Box<ListStatusView> },

    /// Record listing
    Records { items: Vec<JobRecord> },

    /// Ad-hoc run accepted; record created
    JobAccepted { id: String },

    /// Deletion result
    Deleted { count: usize },

    /// Single-instance violation (HTTP 409 upstream)
    Conflict { message: String },

    /// Generic failure
    Error { message: String },
}
