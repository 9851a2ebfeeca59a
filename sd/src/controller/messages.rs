//! Cycle controller messages
//!
//! Control requests and errors for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use crate::status::ListStatusView;

/// Errors from control operations
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("List is already running")]
    AlreadyRunning,

    #[error("List is not paused")]
    NotPaused,

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    /// Single-instance violation; the HTTP layer maps this to 409
    #[error("Job '{0}' is already running")]
    AdHocConflict(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Controller unavailable")]
    Channel,
}

/// Result alias for control operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Commands sent to the cycle controller actor
#[derive(Debug)]
pub enum ControlRequest {
    Start {
        reply: oneshot::Sender<ControlResult<()>>,
    },
    Stop {
        reason: String,
        reply: oneshot::Sender<ControlResult<()>>,
    },
    Pause {
        reason: Option<String>,
        reply: oneshot::Sender<ControlResult<()>>,
    },
    Resume {
        reply: oneshot::Sender<ControlResult<()>>,
    },
    /// Provider quota condition raised (from the executor path)
    QuotaExceeded { tag: String },
    /// Provider quota condition cleared
    QuotaCleared { tag: String },
    /// Single-shot out-of-cycle run; replies with the record id
    RunAdHoc {
        name: String,
        reply: oneshot::Sender<ControlResult<String>>,
    },
    /// Project the current status view
    Status {
        reply: oneshot::Sender<ListStatusView>,
    },
    /// Stop everything and exit the actor
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
