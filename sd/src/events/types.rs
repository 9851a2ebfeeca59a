//! Event types for the sync daemon activity stream
//!
//! The vocabulary covers cycle lifecycle, per-job lifecycle, and provider
//! quota conditions.

use serde::{Deserialize, Serialize};

/// Core event enum - everything observable about the orchestrator
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    // === Cycle lifecycle ===
    /// A cycle has started
    CycleStarted { list: String, cycle: u32 },
    /// A cycle ran every group to the end
    CycleFinished { list: String, cycle: u32, failed_steps: u32 },
    /// The cycle halted at a group boundary
    CyclePaused {
        list: String,
        cycle: u32,
        step_index: usize,
        reason: String,
        manual: bool,
    },
    /// A paused cycle continued
    CycleResumed { list: String, cycle: u32 },
    /// The list was stopped
    CycleStopped { list: String, cycle: u32, reason: String },

    // === Job lifecycle ===
    /// A job record was created
    JobScheduled { record_id: String, name: String },
    /// A job function began executing
    JobStarted { record_id: String, name: String, attempt: u32 },
    /// A job reported progress
    JobProgress { record_id: String, name: String, progress: f64 },
    /// A job failed transiently and is backing off
    JobRetrying {
        record_id: String,
        name: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// A job reached `completed`
    JobCompleted { record_id: String, name: String },
    /// A job reached `failed`
    JobFailed { record_id: String, name: String, error: String },
    /// A job reached `cancelled`
    JobCancelled { record_id: String, name: String, reason: String },
    /// A job was skipped by the workflow definition
    JobSkipped { record_id: String, name: String },

    // === Provider quota ===
    /// The provider reported a quota condition
    QuotaExceeded { tag: String },
    /// A quota condition cleared
    QuotaCleared { tag: String },
}

impl SyncEvent {
    /// Discriminant name for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CycleStarted { .. } => "CycleStarted",
            Self::CycleFinished { .. } => "CycleFinished",
            Self::CyclePaused { .. } => "CyclePaused",
            Self::CycleResumed { .. } => "CycleResumed",
            Self::CycleStopped { .. } => "CycleStopped",
            Self::JobScheduled { .. } => "JobScheduled",
            Self::JobStarted { .. } => "JobStarted",
            Self::JobProgress { .. } => "JobProgress",
            Self::JobRetrying { .. } => "JobRetrying",
            Self::JobCompleted { .. } => "JobCompleted",
            Self::JobFailed { .. } => "JobFailed",
            Self::JobCancelled { .. } => "JobCancelled",
            Self::JobSkipped { .. } => "JobSkipped",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::QuotaCleared { .. } => "QuotaCleared",
        }
    }

    /// Job name for job-scoped events, None for cycle/quota events
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Self::JobScheduled { name, .. }
            | Self::JobStarted { name, .. }
            | Self::JobProgress { name, .. }
            | Self::JobRetrying { name, .. }
            | Self::JobCompleted { name, .. }
            | Self::JobFailed { name, .. }
            | Self::JobCancelled { name, .. }
            | Self::JobSkipped { name, .. } => Some(name),
            _ => None,
        }
    }
}
