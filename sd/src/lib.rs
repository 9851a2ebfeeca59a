//! syncdaemon - cycled-list orchestrator for market-data synchronization
//!
//! The daemon runs a catalogue of named data-fetching jobs in a
//! continuously repeating, dependency-ordered cycle against a rate-limited
//! market-data provider. Cycles pause automatically when the provider's
//! daily quota is spent and resume when it clears; operators can pause,
//! resume, stop, and trigger single jobs over a Unix-socket control
//! surface.
//!
//! # Architecture
//!
//! - [`state`] - actor owning the persistent job record store
//! - [`catalog`] - typed job registry with the built-in sync jobs
//! - [`provider`] - quota-aware market-data client
//! - [`executor`] - supervised single-job runs (retries, cancellation)
//! - [`engine`] - one cycle pass over the workflow definition
//! - [`controller`] - the outer loop, pause gate, and status document
//! - [`status`] - projection served by the status endpoint
//! - [`ipc`] - Unix-socket control protocol
//!
//! Every job execution attempt persists as a `JobRecord`; the orchestrator
//! state persists as a singleton `ListStatus` document. Both survive
//! process restarts, and the controller rehydrates from them on startup.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod domain;
pub mod engine;
pub mod events;
pub mod executor;
pub mod ipc;
pub mod provider;
pub mod state;
pub mod status;

// Re-export commonly used types
pub use catalog::{JobCatalog, JobContext, JobError, JobErrorKind, JobFn, JobSpec, ProgressSink, standard_catalog};
pub use config::Config;
pub use controller::{ControlError, ControllerConfig, ControllerHandle, CycleController};
pub use domain::{
    JobRecord, JobStatus, ListStatus, LogEntry, LogLevel, OverallStatus, StepPointer, WorkflowDefinition,
    WorkflowError, WorkflowStep,
};
pub use engine::{CycleContext, CycleOutcome, PauseControl, PauseGate, StepSignal, WorkflowEngine, pause_gate};
pub use events::{EventBus, SyncEvent, create_event_bus, spawn_event_logger};
pub use executor::{ExecOptions, ExecReport, JobExecutor, JobRunRequest, Outcome, RetryPolicy};
pub use ipc::{ControlMessage, ControlResponse, IpcClient, IpcListener};
pub use provider::{DAILY_LIMIT_TAG, EodhdClient, EodhdConfig, MockProvider, ProviderClient, ProviderError};
pub use state::{StateError, StateEvent, StateManager, TransitionPatch};
pub use status::{ListStatusView, not_initialized, project};
