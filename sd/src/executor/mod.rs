//! Job executor
//!
//! Runs exactly one named job under a supervised envelope: record
//! transitions through the state manager, retries with backoff, progress
//! forwarding, cancellation and timeout handling, quota pause propagation.
//! The executor never returns an error to the workflow engine; every
//! failure mode is absorbed into an [`Outcome`].

mod backoff;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::catalog::{JobCatalog, JobContext, JobErrorKind, JobSpec, ProgressSink};
use crate::domain::{JobRecord, JobStatus, LogEntry, now_ms};
use crate::events::{EventBus, SyncEvent};
use crate::provider::ProviderClient;
use crate::state::{StateError, StateManager, TransitionPatch};

pub use backoff::RetryPolicy;

/// Terminal result of one supervised job run
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(Value),
    Failed(String),
    Cancelled(String),
    /// Quota exhaustion; carries the condition tag. The record sits in
    /// `paused` and the cycled list must stop making progress.
    Paused(String),
    Skipped(String),
}

impl Outcome {
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Supervision options for one run
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub retry: RetryPolicy,
    /// Cancellation is injected into the job's sub-context on expiry
    pub timeout: Option<Duration>,
}

/// Reference to the job to run
#[derive(Debug, Clone)]
pub struct JobRunRequest {
    /// Catalogue key; doubles as the record name
    pub function_name: String,
    pub metadata: Value,
}

/// Result of [`JobExecutor::run`]
#[derive(Debug, Clone)]
pub struct ExecReport {
    /// Record id, when record creation succeeded
    pub record_id: Option<String>,
    pub outcome: Outcome,
}

/// Runs single jobs under supervision
#[derive(Clone)]
pub struct JobExecutor {
    state: StateManager,
    catalog: Arc<JobCatalog>,
    provider: Arc<dyn ProviderClient>,
    events: Arc<EventBus>,
    machine_name: String,
}

impl JobExecutor {
    pub fn new(
        state: StateManager,
        catalog: Arc<JobCatalog>,
        provider: Arc<dyn ProviderClient>,
        events: Arc<EventBus>,
        machine_name: impl Into<String>,
    ) -> Self {
        Self {
            state,
            catalog,
            provider,
            events,
            machine_name: machine_name.into(),
        }
    }

    /// Create a record for the request and drive it to a terminal state
    pub async fn run(&self, request: JobRunRequest, opts: &ExecOptions, cancel: &CancellationToken) -> ExecReport {
        debug!(function = %request.function_name, "run: called");
        if !self.catalog.contains(&request.function_name) {
            // Validation makes this unreachable from the engine; no record
            // is written for a name the catalogue cannot resolve
            error!(function = %request.function_name, "run: unknown function");
            return ExecReport {
                record_id: None,
                outcome: Outcome::Failed(format!("Unknown function: {}", request.function_name)),
            };
        }
        let record = JobRecord::new(&request.function_name, request.metadata);
        let record_id = match self.state.create_record(record).await {
            Ok(id) => id,
            Err(e) => {
                error!(function = %request.function_name, error = %e, "run: record creation failed");
                return ExecReport {
                    record_id: None,
                    outcome: Outcome::Failed(format!("Record creation failed: {}", e)),
                };
            }
        };
        self.events.emit(SyncEvent::JobScheduled {
            record_id: record_id.clone(),
            name: request.function_name.clone(),
        });

        let outcome = self.drive(&record_id, opts, cancel).await;
        ExecReport {
            record_id: Some(record_id),
            outcome,
        }
    }

    /// Drive an existing record (scheduled, paused, retrying, or orphaned
    /// running) to a terminal state
    pub async fn drive(&self, record_id: &str, opts: &ExecOptions, cancel: &CancellationToken) -> Outcome {
        debug!(%record_id, "drive: called");
        let record = match self.state.get_record_required(record_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(%record_id, error = %e, "drive: record unreadable");
                return Outcome::Failed(format!("Record unreadable: {}", e));
            }
        };
        let name = record.name.clone();

        let Some(spec) = self.catalog.lookup(&name).cloned() else {
            // The function vanished from the catalogue (config change
            // across a restart); cancel the record rather than crash
            warn!(%record_id, %name, "drive: function missing from catalogue");
            let reason = format!("Unknown function: {}", name);
            return self
                .finalize_as(
                    record_id,
                    &name,
                    record.status,
                    JobStatus::Cancelled,
                    TransitionPatch::ended(now_ms()).with_error(reason.clone()),
                    || Outcome::Cancelled(reason.clone()),
                )
                .await;
        };

        // Entry transition into the running state
        match self.enter_running(record_id, record.status).await {
            Ok(()) => {}
            Err(outcome) => return outcome,
        }

        let mut attempt: u32 = 0;
        loop {
            self.events.emit(SyncEvent::JobStarted {
                record_id: record_id.to_string(),
                name: name.clone(),
                attempt: attempt + 1,
            });

            let result = self.invoke(record_id, &name, &spec, opts, cancel).await;

            match result {
                InvokeResult::Success(value) => {
                    let patch = TransitionPatch::ended(now_ms()).with_result(value.clone()).with_progress(1.0);
                    let outcome = self
                        .finalize(record_id, &name, JobStatus::Running, JobStatus::Completed, patch)
                        .await;
                    if outcome.is_completed() {
                        self.events.emit(SyncEvent::JobCompleted {
                            record_id: record_id.to_string(),
                            name: name.clone(),
                        });
                        return Outcome::Completed(value);
                    }
                    return outcome;
                }
                InvokeResult::Quota { tag } => {
                    // Quota pauses do not consume a retry
                    let patch = TransitionPatch::default()
                        .with_error(format!("Provider quota exceeded: {}", tag))
                        .with_log(LogEntry::warn(format!("paused on quota condition {}", tag)));
                    let outcome = self
                        .finalize_as(record_id, &name, JobStatus::Running, JobStatus::Paused, patch, || {
                            Outcome::Paused(tag.clone())
                        })
                        .await;
                    self.events.emit(SyncEvent::QuotaExceeded { tag: tag.clone() });
                    return outcome;
                }
                InvokeResult::Cancelled { reason } => {
                    let patch = TransitionPatch::ended(now_ms())
                        .with_error(reason.clone())
                        .with_log(LogEntry::info(format!("cancelled: {}", reason)));
                    let outcome = self
                        .finalize_as(record_id, &name, JobStatus::Running, JobStatus::Cancelled, patch, || {
                            Outcome::Cancelled(reason.clone())
                        })
                        .await;
                    self.events.emit(SyncEvent::JobCancelled {
                        record_id: record_id.to_string(),
                        name: name.clone(),
                        reason,
                    });
                    return outcome;
                }
                InvokeResult::Error { message, details, fatal } => {
                    let retries_left = !fatal && attempt < opts.retry.max_retries;
                    if !retries_left {
                        let mut patch = TransitionPatch::ended(now_ms()).with_error(message.clone());
                        if let Some(details) = details {
                            patch = patch.with_error_details(details);
                        }
                        let outcome = self
                            .finalize(record_id, &name, JobStatus::Running, JobStatus::Failed, patch)
                            .await;
                        if outcome.is_failed() {
                            self.events.emit(SyncEvent::JobFailed {
                                record_id: record_id.to_string(),
                                name: name.clone(),
                                error: message.clone(),
                            });
                        }
                        return outcome;
                    }

                    attempt += 1;
                    let delay = opts.retry.delay(attempt);
                    debug!(%record_id, attempt, ?delay, "drive: transient failure, backing off");

                    // Progress resets for the new attempt
                    let patch = TransitionPatch::default()
                        .with_progress(0.0)
                        .with_error(message.clone())
                        .with_log(LogEntry::warn(format!(
                            "attempt {} failed ({}), retrying in {:?}",
                            attempt, message, delay
                        )));
                    if let Err(outcome) = self
                        .checked_transition(record_id, JobStatus::Running, JobStatus::Retrying, patch)
                        .await
                    {
                        return outcome;
                    }
                    self.events.emit(SyncEvent::JobRetrying {
                        record_id: record_id.to_string(),
                        name: name.clone(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                    });

                    // Backoff sleep wakes early on cancellation
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            let patch = TransitionPatch::ended(now_ms()).with_error("cancelled during backoff");
                            return self
                                .finalize_as(record_id, &name, JobStatus::Retrying, JobStatus::Cancelled, patch, || {
                                    Outcome::Cancelled("cancelled during backoff".to_string())
                                })
                                .await;
                        }
                    }

                    let patch = TransitionPatch::started(now_ms(), self.machine_name.clone());
                    if let Err(outcome) = self
                        .checked_transition(record_id, JobStatus::Retrying, JobStatus::Running, patch)
                        .await
                    {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Move the record into `running`, whatever resumable state it is in
    async fn enter_running(&self, record_id: &str, status: JobStatus) -> Result<(), Outcome> {
        let machine = self.machine_name.clone();
        match status {
            JobStatus::Scheduled => {
                self.checked_transition(
                    record_id,
                    JobStatus::Scheduled,
                    JobStatus::Running,
                    TransitionPatch::started(now_ms(), machine),
                )
                .await
            }
            JobStatus::Paused => {
                self.checked_transition(
                    record_id,
                    JobStatus::Paused,
                    JobStatus::Retrying,
                    TransitionPatch::default()
                        .with_progress(0.0)
                        .with_log(LogEntry::info("resuming after pause")),
                )
                .await?;
                self.checked_transition(
                    record_id,
                    JobStatus::Retrying,
                    JobStatus::Running,
                    TransitionPatch::started(now_ms(), machine),
                )
                .await
            }
            JobStatus::Retrying => {
                self.checked_transition(
                    record_id,
                    JobStatus::Retrying,
                    JobStatus::Running,
                    TransitionPatch::started(now_ms(), machine),
                )
                .await
            }
            JobStatus::Running => {
                // Orphaned by a previous process; restart the attempt
                self.checked_transition(
                    record_id,
                    JobStatus::Running,
                    JobStatus::Retrying,
                    TransitionPatch::default()
                        .with_progress(0.0)
                        .with_log(LogEntry::warn("recovered orphaned running record")),
                )
                .await?;
                self.checked_transition(
                    record_id,
                    JobStatus::Retrying,
                    JobStatus::Running,
                    TransitionPatch::started(now_ms(), machine),
                )
                .await
            }
            terminal => Err(self.outcome_from_observed(record_id, terminal).await),
        }
    }

    /// Invoke the job function once, racing cancellation and timeout
    async fn invoke(
        &self,
        record_id: &str,
        name: &str,
        spec: &JobSpec,
        opts: &ExecOptions,
        cancel: &CancellationToken,
    ) -> InvokeResult {
        let record = match self.state.get_record_required(record_id).await {
            Ok(record) => record,
            Err(e) => {
                return InvokeResult::Error {
                    message: format!("Record unreadable: {}", e),
                    details: None,
                    fatal: true,
                };
            }
        };

        // Timeout cancels only this job's sub-context
        let job_token = cancel.child_token();
        let timeout_guard = opts.timeout.map(|timeout| {
            let token = job_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });

        // Progress flows through the state manager off the job's hot path
        let (sink, mut progress_rx) = ProgressSink::channel();
        let forwarder = {
            let state = self.state.clone();
            let events = self.events.clone();
            let record_id = record_id.to_string();
            let name = name.to_string();
            tokio::spawn(async move {
                while let Some(fraction) = progress_rx.recv().await {
                    match state.set_progress(&record_id, fraction).await {
                        Ok(()) => events.emit(SyncEvent::JobProgress {
                            record_id: record_id.clone(),
                            name: name.clone(),
                            progress: fraction,
                        }),
                        Err(StateError::ProgressRegression { .. }) => {
                            debug!(%record_id, fraction, "progress regression dropped");
                        }
                        Err(e) => warn!(%record_id, error = %e, "progress write failed"),
                    }
                }
            })
        };

        let ctx = JobContext {
            cancel: job_token.clone(),
            provider: self.provider.clone(),
            progress: sink,
            metadata: record.metadata.clone(),
        };

        let result = tokio::select! {
            result = spec.func.run(ctx) => Some(result),
            _ = job_token.cancelled() => None,
        };

        if let Some(guard) = timeout_guard {
            guard.abort();
        }
        // The sink inside ctx is gone once the job future resolves or is
        // dropped, so the forwarder drains and exits on its own
        let _ = forwarder.await;

        let timed_out = job_token.is_cancelled() && !cancel.is_cancelled();
        match result {
            None => InvokeResult::Cancelled {
                reason: if timed_out { "timeout".to_string() } else { "stopped".to_string() },
            },
            Some(Ok(value)) => InvokeResult::Success(value),
            Some(Err(err)) if cancel.is_cancelled() => InvokeResult::Cancelled {
                reason: format!("stopped ({})", err.message),
            },
            Some(Err(_)) if timed_out => InvokeResult::Cancelled {
                reason: "timeout".to_string(),
            },
            Some(Err(err)) => match err.kind {
                JobErrorKind::Quota { tag } => InvokeResult::Quota { tag },
                JobErrorKind::Fatal => InvokeResult::Error {
                    message: err.message,
                    details: err.details,
                    fatal: true,
                },
                JobErrorKind::Transient => InvokeResult::Error {
                    message: err.message,
                    details: err.details,
                    fatal: false,
                },
            },
        }
    }

    /// Transition, mapping conflicts to an authoritative external outcome
    async fn checked_transition(
        &self,
        record_id: &str,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
    ) -> Result<(), Outcome> {
        match self.state.transition(record_id, from, to, patch).await {
            Ok(_) => Ok(()),
            Err(StateError::Conflict { actual, .. }) => {
                let observed = actual.unwrap_or(JobStatus::Failed);
                warn!(%record_id, %from, %to, %observed, "checked_transition: lost the race, honouring observed state");
                Err(self.outcome_from_observed(record_id, observed).await)
            }
            Err(e) => {
                error!(%record_id, error = %e, "checked_transition: state error");
                Err(Outcome::Failed(format!("State error: {}", e)))
            }
        }
    }

    /// Transition into a terminal/paused state and build the outcome
    async fn finalize(
        &self,
        record_id: &str,
        name: &str,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
    ) -> Outcome {
        let error = patch.error.clone();
        self.finalize_as(record_id, name, from, to, patch, || match to {
            JobStatus::Completed => Outcome::Completed(Value::Null),
            JobStatus::Cancelled => Outcome::Cancelled(error.clone().unwrap_or_else(|| "cancelled".to_string())),
            _ => Outcome::Failed(error.clone().unwrap_or_else(|| "failed".to_string())),
        })
        .await
    }

    async fn finalize_as(
        &self,
        record_id: &str,
        _name: &str,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
        outcome: impl Fn() -> Outcome,
    ) -> Outcome {
        match self.checked_transition(record_id, from, to, patch).await {
            Ok(()) => outcome(),
            Err(external) => external,
        }
    }

    /// Map an externally-written status to the outcome the caller reports
    async fn outcome_from_observed(&self, record_id: &str, observed: JobStatus) -> Outcome {
        let record = self.state.get_record(record_id).await.ok().flatten();
        let error = record.as_ref().and_then(|r| r.error.clone());
        match observed {
            JobStatus::Completed => {
                Outcome::Completed(record.and_then(|r| r.result).unwrap_or(Value::Null))
            }
            JobStatus::Cancelled => Outcome::Cancelled(error.unwrap_or_else(|| "cancelled externally".to_string())),
            JobStatus::Skipped => Outcome::Skipped("skipped externally".to_string()),
            JobStatus::Paused => Outcome::Paused(error.unwrap_or_else(|| "paused externally".to_string())),
            JobStatus::Failed => Outcome::Failed(error.unwrap_or_else(|| "failed externally".to_string())),
            other => Outcome::Failed(format!("Unexpected external state: {}", other)),
        }
    }
}

/// Internal classification of one invocation
enum InvokeResult {
    Success(Value),
    Quota { tag: String },
    Cancelled { reason: String },
    Error {
        message: String,
        details: Option<Value>,
        fatal: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{JobCatalog, JobError, JobFn, JobSpec};
    use crate::events::create_event_bus;
    use crate::provider::MockProvider;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        /// Errors to return before succeeding
        failures: AtomicU32,
        kind: JobErrorKind,
    }

    #[async_trait]
    impl JobFn for Scripted {
        async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
            ctx.progress.report(0.5);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(match &self.kind {
                    JobErrorKind::Transient => JobError::transient("scripted transient"),
                    JobErrorKind::Fatal => JobError::fatal("scripted fatal"),
                    JobErrorKind::Quota { tag } => JobError::quota(tag.clone()),
                });
            }
            Ok(json!({"ok": true}))
        }
    }

    struct Hanging;

    #[async_trait]
    impl JobFn for Hanging {
        async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
            ctx.cancel.cancelled().await;
            Err(JobError::transient("woke up cancelled"))
        }
    }

    fn spec_with(name: &str, func: Arc<dyn JobFn>) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            category: "test".into(),
            scope: "test".into(),
            priority: 5,
            estimated_duration_secs: None,
            data_source: "mock".into(),
            tags: vec![],
            dependencies: vec![],
            cron_definition: None,
            func,
        }
    }

    async fn executor_with(jobs: Vec<(&str, Arc<dyn JobFn>)>) -> (tempfile::TempDir, JobExecutor, StateManager) {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::spawn(dir.path().join("state.db")).unwrap();
        let mut catalog = JobCatalog::new();
        for (name, func) in jobs {
            catalog.register(spec_with(name, func)).unwrap();
        }
        let executor = JobExecutor::new(
            state.clone(),
            Arc::new(catalog),
            Arc::new(MockProvider::new()),
            create_event_bus(),
            "test-host",
        );
        (dir, executor, state)
    }

    fn fast_opts(max_retries: u32) -> ExecOptions {
        ExecOptions {
            retry: RetryPolicy {
                max_retries,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            timeout: None,
        }
    }

    fn request(name: &str) -> JobRunRequest {
        JobRunRequest {
            function_name: name.to_string(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn test_success_lifecycle() {
        let job = Arc::new(Scripted {
            failures: AtomicU32::new(0),
            kind: JobErrorKind::Transient,
        });
        let (_dir, executor, state) = executor_with(vec![("job_a", job)]).await;

        let report = executor.run(request("job_a"), &fast_opts(0), &CancellationToken::new()).await;
        assert!(report.outcome.is_completed());

        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 1.0);
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
        assert_eq!(record.machine_name.as_deref(), Some("test-host"));
        assert_eq!(record.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_retries_then_success() {
        let job = Arc::new(Scripted {
            failures: AtomicU32::new(2),
            kind: JobErrorKind::Transient,
        });
        let (_dir, executor, state) = executor_with(vec![("job_a", job)]).await;

        let report = executor.run(request("job_a"), &fast_opts(3), &CancellationToken::new()).await;
        assert!(report.outcome.is_completed());

        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        // Two backoff log entries from the two failed attempts
        assert_eq!(record.logs.iter().filter(|l| l.msg.contains("retrying in")).count(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails() {
        let job = Arc::new(Scripted {
            failures: AtomicU32::new(10),
            kind: JobErrorKind::Transient,
        });
        let (_dir, executor, state) = executor_with(vec![("job_a", job)]).await;

        let report = executor.run(request("job_a"), &fast_opts(2), &CancellationToken::new()).await;
        assert!(report.outcome.is_failed());

        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("scripted transient"));
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_fatal_bypasses_retries() {
        let job = Arc::new(Scripted {
            failures: AtomicU32::new(5),
            kind: JobErrorKind::Fatal,
        });
        let (_dir, executor, state) = executor_with(vec![("job_a", job)]).await;

        let report = executor.run(request("job_a"), &fast_opts(5), &CancellationToken::new()).await;
        assert!(report.outcome.is_failed());

        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        // No retry logs: the first fatal error ended it
        assert!(record.logs.iter().all(|l| !l.msg.contains("retrying in")));
    }

    #[tokio::test]
    async fn test_quota_pauses_without_consuming_retry() {
        let job = Arc::new(Scripted {
            failures: AtomicU32::new(1),
            kind: JobErrorKind::Quota {
                tag: "EODHD_DAILY_LIMIT".into(),
            },
        });
        let (_dir, executor, state) = executor_with(vec![("job_a", job.clone())]).await;

        let report = executor.run(request("job_a"), &fast_opts(3), &CancellationToken::new()).await;
        let record_id = report.record_id.clone().unwrap();
        match &report.outcome {
            Outcome::Paused(tag) => assert_eq!(tag, "EODHD_DAILY_LIMIT"),
            other => panic!("Expected Paused, got {:?}", other),
        }

        let record = state.get_record_required(&record_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Paused);
        assert!(record.ended_at.is_none());

        // Resume drives paused -> retrying -> running -> completed
        let outcome = executor.drive(&record_id, &fast_opts(3), &CancellationToken::new()).await;
        assert!(outcome.is_completed());
        let record = state.get_record_required(&record_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancellation_mid_job() {
        let (_dir, executor, state) = executor_with(vec![("job_a", Arc::new(Hanging) as Arc<dyn JobFn>)]).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = executor.run(request("job_a"), &fast_opts(3), &cancel).await;
        assert!(report.outcome.is_cancelled());

        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_timeout_cancels_subcontext_only() {
        let (_dir, executor, state) = executor_with(vec![("job_a", Arc::new(Hanging) as Arc<dyn JobFn>)]).await;

        let cancel = CancellationToken::new();
        let opts = ExecOptions {
            retry: fast_opts(0).retry,
            timeout: Some(Duration::from_millis(50)),
        };
        let report = executor.run(request("job_a"), &opts, &cancel).await;
        match &report.outcome {
            Outcome::Cancelled(reason) => assert!(reason.contains("timeout"), "reason: {}", reason),
            other => panic!("Expected Cancelled, got {:?}", other),
        }
        // The shared token is untouched
        assert!(!cancel.is_cancelled());

        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_external_cancel_wins_conflict() {
        let job = Arc::new(Scripted {
            failures: AtomicU32::new(0),
            kind: JobErrorKind::Transient,
        });
        let (_dir, executor, state) = executor_with(vec![("job_a", job)]).await;

        // Record cancelled before the executor gets to it
        let id = state
            .create_record(JobRecord::new("job_a", json!({})))
            .await
            .unwrap();
        state
            .transition(&id, JobStatus::Scheduled, JobStatus::Cancelled, TransitionPatch::ended(now_ms()))
            .await
            .unwrap();

        let outcome = executor.drive(&id, &fast_opts(0), &CancellationToken::new()).await;
        assert!(outcome.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_function_creates_no_record() {
        let (_dir, executor, state) = executor_with(vec![]).await;
        let report = executor.run(request("missing"), &fast_opts(0), &CancellationToken::new()).await;
        assert!(report.outcome.is_failed());
        assert!(report.record_id.is_none());
        assert!(state.find_by_name("missing", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_vanished_function_cancels_record() {
        // A record persisted by an older configuration whose function no
        // longer exists
        let (_dir, executor, state) = executor_with(vec![]).await;
        let id = state
            .create_record(JobRecord::new("retired_job", json!({})))
            .await
            .unwrap();

        let outcome = executor.drive(&id, &fast_opts(0), &CancellationToken::new()).await;
        assert!(outcome.is_cancelled());
        let record = state.get_record_required(&id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.error.as_deref().unwrap_or_default().contains("Unknown function"));
    }

    #[tokio::test]
    async fn test_progress_forwarded() {
        struct Reporting;

        #[async_trait]
        impl JobFn for Reporting {
            async fn run(&self, ctx: JobContext) -> Result<Value, JobError> {
                ctx.progress.report(0.25);
                ctx.progress.report(0.75);
                // Let the forwarder drain before returning
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!({}))
            }
        }

        let (_dir, executor, state) = executor_with(vec![("job_a", Arc::new(Reporting) as Arc<dyn JobFn>)]).await;
        let report = executor.run(request("job_a"), &fast_opts(0), &CancellationToken::new()).await;
        assert!(report.outcome.is_completed());
        let record = state.get_record_required(report.record_id.as_deref().unwrap()).await.unwrap();
        // Final progress forced to 1.0 by completion
        assert_eq!(record.progress, 1.0);
        assert_eq!(record.status, JobStatus::Completed);
    }
}
