//! State manager messages
//!
//! Commands and responses for the actor pattern.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{JobRecord, JobStatus, ListStatus, LogEntry};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Transition conflict: record is {actual:?}, expected {expected}")]
    Conflict {
        expected: JobStatus,
        /// Status observed by the losing writer; None when the record vanished
        actual: Option<JobStatus>,
    },

    #[error("Illegal transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Progress regression: {current} -> {requested}")]
    ProgressRegression { current: f64, requested: f64 },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Fields applied atomically alongside a status transition
#[derive(Debug, Default, Clone)]
pub struct TransitionPatch {
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub progress: Option<f64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_details: Option<Value>,
    pub machine_name: Option<String>,
    pub log: Option<LogEntry>,
}

impl TransitionPatch {
    pub fn started(now: i64, machine_name: impl Into<String>) -> Self {
        Self {
            started_at: Some(now),
            machine_name: Some(machine_name.into()),
            ..Default::default()
        }
    }

    pub fn ended(now: i64) -> Self {
        Self {
            ended_at: Some(now),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_error_details(mut self, details: Value) -> Self {
        self.error_details = Some(details);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_log(mut self, log: LogEntry) -> Self {
        self.log = Some(log);
        self
    }
}

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Record lifecycle
    CreateRecord {
        record: JobRecord,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetRecord {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<JobRecord>>>,
    },
    Transition {
        id: String,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
        reply: oneshot::Sender<StateResponse<JobRecord>>,
    },
    AppendLog {
        id: String,
        entry: LogEntry,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    SetProgress {
        id: String,
        value: f64,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    UpdateMetadata {
        id: String,
        patch: Value,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Queries
    FindByName {
        name: String,
        limit: Option<usize>,
        reply: oneshot::Sender<StateResponse<Vec<JobRecord>>>,
    },
    FindRunning {
        reply: oneshot::Sender<StateResponse<Vec<JobRecord>>>,
    },
    FindRecent {
        since: i64,
        reply: oneshot::Sender<StateResponse<Vec<JobRecord>>>,
    },
    FindByCycle {
        list: String,
        cycle: u32,
        reply: oneshot::Sender<StateResponse<Vec<JobRecord>>>,
    },
    FindLatestFinished {
        name: String,
        reply: oneshot::Sender<StateResponse<Option<JobRecord>>>,
    },

    // Deletion
    DeleteRecord {
        id: String,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    DeleteAllRecords {
        reply: oneshot::Sender<StateResponse<usize>>,
    },

    // Status document
    UpsertListStatus {
        doc: Box<ListStatus>,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    GetListStatus {
        name: String,
        reply: oneshot::Sender<StateResponse<Option<ListStatus>>>,
    },

    // Shutdown
    Shutdown,
}
