//! Cycle controller
//!
//! Owns the outer lifecycle of one cycled list: the cycle counter, the
//! pause gate, the status document, and ad-hoc runs. It is the sole writer
//! of the status document; every other component signals intent through
//! the control channel or the engine's step signals.

mod messages;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::JobCatalog;
use crate::domain::{JobStatus, ListStatus, OverallStatus, StepPointer, WorkflowDefinition, meta, now_ms};
use crate::engine::{CycleContext, CycleOutcome, PauseControl, StepSignal, WorkflowEngine, pause_gate};
use crate::events::{EventBus, SyncEvent};
use crate::executor::{ExecOptions, JobExecutor};
use crate::state::StateManager;
use crate::status::{ListStatusView, project};

pub use messages::{ControlError, ControlRequest, ControlResult};

/// Static configuration for one cycle controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub list_name: String,
    pub node_id: String,
    /// Begin cycling immediately after initialisation
    pub autostart: bool,
    pub max_cycles: Option<u32>,
    /// Delay between cycles; None runs them back to back
    pub cycle_interval: Option<Duration>,
}

/// Handle for sending control requests
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<ControlResult<T>>) -> ControlRequest,
    ) -> ControlResult<T> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| ControlError::Channel)?;
        reply_rx.await.map_err(|_| ControlError::Channel)?
    }

    pub async fn start(&self) -> ControlResult<()> {
        self.request(|reply| ControlRequest::Start { reply }).await
    }

    pub async fn stop(&self, reason: impl Into<String>) -> ControlResult<()> {
        let reason = reason.into();
        self.request(|reply| ControlRequest::Stop { reason, reply }).await
    }

    pub async fn pause_manually(&self, reason: Option<String>) -> ControlResult<()> {
        self.request(|reply| ControlRequest::Pause { reason, reply }).await
    }

    pub async fn resume_manually(&self) -> ControlResult<()> {
        self.request(|reply| ControlRequest::Resume { reply }).await
    }

    pub async fn report_quota_exceeded(&self, tag: impl Into<String>) {
        let _ = self.tx.send(ControlRequest::QuotaExceeded { tag: tag.into() }).await;
    }

    pub async fn report_quota_cleared(&self, tag: impl Into<String>) {
        let _ = self.tx.send(ControlRequest::QuotaCleared { tag: tag.into() }).await;
    }

    /// Run a single job outside the cycle; replies with the record id
    pub async fn run_ad_hoc(&self, name: impl Into<String>) -> ControlResult<String> {
        let name = name.into();
        self.request(|reply| ControlRequest::RunAdHoc { name, reply }).await
    }

    pub async fn status(&self) -> ControlResult<ListStatusView> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(ControlRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| ControlError::Channel)?;
        reply_rx.await.map_err(|_| ControlError::Channel)
    }

    /// Stop the list and terminate the actor
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(ControlRequest::Shutdown { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// The cycle controller actor
pub struct CycleController {
    config: ControllerConfig,
    def: WorkflowDefinition,
    catalog: Arc<JobCatalog>,
    state: StateManager,
    engine: WorkflowEngine,
    executor: JobExecutor,
    events: Arc<EventBus>,
    exec_opts: ExecOptions,

    /// In-memory authoritative copy of the status document
    doc: ListStatus,
    pause_control: PauseControl,
    /// Daemon-level shutdown token
    shutdown: CancellationToken,
    /// Cancels the in-flight cycle and ad-hoc runs on stop
    cycle_cancel: CancellationToken,

    /// Whether the list is actively cycling
    started: bool,
    /// A cycle task is in flight
    cycle_in_flight: bool,
    /// Wake-up time for the inter-cycle sleep
    next_cycle_at: Option<Instant>,

    rx: mpsc::Receiver<ControlRequest>,
    step_rx: mpsc::UnboundedReceiver<StepSignal>,
    step_tx: mpsc::UnboundedSender<StepSignal>,
    done_rx: mpsc::Receiver<(u32, CycleOutcome)>,
    done_tx: mpsc::Sender<(u32, CycleOutcome)>,
}

impl CycleController {
    /// Validate the workflow, initialise the status document, and spawn
    /// the controller actor
    ///
    /// Configuration errors (unknown or duplicate functions, empty
    /// workflow) abort initialisation here.
    pub async fn spawn(
        config: ControllerConfig,
        def: WorkflowDefinition,
        catalog: Arc<JobCatalog>,
        state: StateManager,
        executor: JobExecutor,
        events: Arc<EventBus>,
        exec_opts: ExecOptions,
        shutdown: CancellationToken,
    ) -> eyre::Result<ControllerHandle> {
        def.validate(|name| catalog.contains(name))
            .map_err(|e| eyre::eyre!("Invalid workflow definition: {}", e))?;

        // Rehydrate the persisted document, or create a fresh one
        let mut doc = state
            .get_list_status(&config.list_name)
            .await
            .map_err(|e| eyre::eyre!("Cannot read list status: {}", e))?
            .unwrap_or_else(|| ListStatus::new(&config.list_name));

        doc.max_cycles = config.max_cycles;
        doc.cycle_interval_ms = config.cycle_interval.map(|d| d.as_millis() as i64);
        doc.touch();

        let (pause_control, _) = pause_gate();
        let mut started = false;
        match doc.overall_status {
            OverallStatus::NotInitialized => {
                if config.autostart {
                    doc.mark_running();
                    started = true;
                }
            }
            OverallStatus::Running => {
                // Process restart mid-run: continue from the recorded cycle
                info!(list = %config.list_name, cycle = doc.current_cycle, "spawn: resuming running list after restart");
                started = true;
            }
            OverallStatus::Paused => {
                info!(list = %config.list_name, reason = ?doc.pause_reason, "spawn: rehydrating paused list");
                pause_control.close(doc.pause_reason.clone().unwrap_or_else(|| "paused".to_string()));
                started = true;
            }
            OverallStatus::Stopped | OverallStatus::Completed => {}
        }

        state
            .upsert_list_status(doc.clone())
            .await
            .map_err(|e| eyre::eyre!("Cannot write list status: {}", e))?;

        let engine = WorkflowEngine::new(state.clone(), executor.clone(), events.clone(), exec_opts.clone());

        let (tx, rx) = mpsc::channel(64);
        let (step_tx, step_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::channel(1);

        let controller = Self {
            cycle_cancel: shutdown.child_token(),
            config,
            def,
            catalog,
            state,
            engine,
            executor,
            events,
            exec_opts,
            doc,
            pause_control,
            shutdown,
            started,
            cycle_in_flight: false,
            next_cycle_at: None,
            rx,
            step_rx,
            step_tx,
            done_rx,
            done_tx,
        };

        tokio::spawn(controller.run());
        Ok(ControllerHandle { tx })
    }

    /// The actor loop
    async fn run(mut self) {
        debug!(list = %self.config.list_name, "run: controller started");
        loop {
            self.maybe_start_cycle().await;

            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle_request(request).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                Some(signal) = self.step_rx.recv() => {
                    self.handle_step_signal(signal).await;
                }
                Some((cycle, outcome)) = self.done_rx.recv() => {
                    self.handle_cycle_outcome(cycle, outcome).await;
                }
                _ = sleep_until_opt(self.next_cycle_at), if self.next_cycle_at.is_some() => {
                    debug!(list = %self.config.list_name, "run: inter-cycle sleep elapsed");
                    self.next_cycle_at = None;
                    self.doc.next_cycle_scheduled = None;
                }
                _ = self.shutdown.cancelled() => {
                    // Leave overall_status as-is: a restarted daemon
                    // rehydrates a running/paused list and continues the
                    // open cycle
                    debug!(list = %self.config.list_name, "run: daemon shutdown");
                    break;
                }
            }
        }
        debug!(list = %self.config.list_name, "run: controller exited");
    }

    /// Whether the in-memory cycle counter refers to an unfinished cycle
    fn cycle_open(&self) -> bool {
        self.doc.current_cycle > self.doc.total_cycles
    }

    /// Start the next (or resume the open) cycle when the list is due
    async fn maybe_start_cycle(&mut self) {
        if !self.started || self.cycle_in_flight || self.doc.is_paused || self.next_cycle_at.is_some() {
            return;
        }

        // Cycle budget check happens before starting, so max_cycles = 0
        // completes immediately
        if !self.cycle_open() {
            if let Some(max) = self.config.max_cycles {
                if self.doc.current_cycle >= max {
                    info!(list = %self.config.list_name, max, "maybe_start_cycle: cycle budget reached");
                    self.doc.mark_completed();
                    self.started = false;
                    self.write_doc().await;
                    return;
                }
            }
            self.doc.current_cycle += 1;
            self.doc.current_async_fn_index = None;
            self.doc.completed_async_fns = 0;
            self.doc.failed_async_fns = 0;
            self.doc.progress = 0.0;
            info!(list = %self.config.list_name, cycle = self.doc.current_cycle, "Starting cycle");
            self.events.emit(SyncEvent::CycleStarted {
                list: self.config.list_name.clone(),
                cycle: self.doc.current_cycle,
            });
        } else {
            info!(list = %self.config.list_name, cycle = self.doc.current_cycle, "Re-entering open cycle");
        }
        self.write_doc().await;

        if self.cycle_cancel.is_cancelled() {
            self.cycle_cancel = self.shutdown.child_token();
        }

        let cycle = self.doc.current_cycle;
        let ctx = CycleContext {
            cancel: self.cycle_cancel.clone(),
            gate: self.pause_control.gate(),
            node_id: self.config.node_id.clone(),
            step_tx: Some(self.step_tx.clone()),
        };
        let engine = self.engine.clone();
        let def = self.def.clone();
        let done_tx = self.done_tx.clone();
        self.cycle_in_flight = true;

        tokio::spawn(async move {
            let outcome = engine.run_cycle(&def, cycle, &ctx).await;
            let _ = done_tx.send((cycle, outcome)).await;
        });
    }

    async fn handle_cycle_outcome(&mut self, cycle: u32, outcome: CycleOutcome) {
        debug!(list = %self.config.list_name, cycle, ?outcome, "handle_cycle_outcome: called");
        self.cycle_in_flight = false;

        match outcome {
            CycleOutcome::Finished => {
                self.doc.total_cycles += 1;
                self.refresh_counters(cycle).await;
                self.doc.current_async_fn = None;
                self.doc.next_async_fn = None;
                self.doc.current_async_fn_index = None;

                let failed = self.doc.failed_async_fns;
                info!(list = %self.config.list_name, cycle, failed_steps = failed, "Cycle finished");
                self.events.emit(SyncEvent::CycleFinished {
                    list: self.config.list_name.clone(),
                    cycle,
                    failed_steps: failed,
                });

                let budget_spent = self
                    .config
                    .max_cycles
                    .is_some_and(|max| self.doc.current_cycle >= max);
                if budget_spent {
                    self.doc.mark_completed();
                    self.started = false;
                } else if let Some(interval) = self.config.cycle_interval {
                    self.doc.next_cycle_scheduled = Some(now_ms() + interval.as_millis() as i64);
                    self.next_cycle_at = Some(Instant::now() + interval);
                }
                self.write_doc().await;
            }
            CycleOutcome::Paused { step_index, reason } => {
                // A closed gate means the pause was already recorded by the
                // control path (manual or out-of-band quota); an open gate
                // means a step raised it (quota condition from the provider)
                if !self.pause_control.is_closed() {
                    self.pause_control.close(reason.clone());
                    self.doc.mark_paused(false, Some(reason.clone()));
                    self.doc.add_pause_condition(&reason);
                }
                self.doc.current_async_fn_index = Some(step_index);
                self.refresh_counters(cycle).await;
                info!(list = %self.config.list_name, cycle, step_index, %reason, manual = self.doc.manual_pause, "Cycle paused");
                self.events.emit(SyncEvent::CyclePaused {
                    list: self.config.list_name.clone(),
                    cycle,
                    step_index,
                    reason,
                    manual: self.doc.manual_pause,
                });
                self.write_doc().await;
            }
            CycleOutcome::Cancelled => {
                let reason = self
                    .doc
                    .stop_reason
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string());
                self.doc.mark_stopped(Some(reason.clone()));
                self.started = false;
                info!(list = %self.config.list_name, cycle, %reason, "Cycle stopped");
                self.events.emit(SyncEvent::CycleStopped {
                    list: self.config.list_name.clone(),
                    cycle,
                    reason,
                });
                self.write_doc().await;
            }
        }
    }

    /// Process one control request; returns true when the actor must exit
    async fn handle_request(&mut self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::Start { reply } => {
                let result = if self.started {
                    Err(ControlError::AlreadyRunning)
                } else {
                    info!(list = %self.config.list_name, "Start requested");
                    self.started = true;
                    self.doc.mark_running();
                    self.pause_control.open();
                    self.write_doc().await;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            ControlRequest::Stop { reason, reply } => {
                info!(list = %self.config.list_name, %reason, "Stop requested");
                self.doc.stop_reason = Some(reason.clone());
                self.started = false;
                self.next_cycle_at = None;
                if self.cycle_in_flight {
                    // The Cancelled outcome finalises the document
                    self.cycle_cancel.cancel();
                } else {
                    self.doc.mark_stopped(Some(reason.clone()));
                    self.events.emit(SyncEvent::CycleStopped {
                        list: self.config.list_name.clone(),
                        cycle: self.doc.current_cycle,
                        reason,
                    });
                    self.write_doc().await;
                }
                let _ = reply.send(Ok(()));
            }
            ControlRequest::Pause { reason, reply } => {
                let reason_text = reason.unwrap_or_else(|| "manual pause".to_string());
                info!(list = %self.config.list_name, %reason_text, "Manual pause requested");
                self.pause_control.close(reason_text.clone());
                self.doc.mark_paused(true, Some(reason_text.clone()));
                self.next_cycle_at = None;
                self.doc.next_cycle_scheduled = None;
                self.write_doc().await;
                if !self.cycle_in_flight {
                    self.events.emit(SyncEvent::CyclePaused {
                        list: self.config.list_name.clone(),
                        cycle: self.doc.current_cycle,
                        step_index: self.doc.current_async_fn_index.unwrap_or(0),
                        reason: reason_text,
                        manual: true,
                    });
                }
                let _ = reply.send(Ok(()));
            }
            ControlRequest::Resume { reply } => {
                let result = if !self.doc.is_paused {
                    Err(ControlError::NotPaused)
                } else {
                    info!(list = %self.config.list_name, "Manual resume requested");
                    self.resume().await;
                    Ok(())
                };
                let _ = reply.send(result);
            }
            ControlRequest::QuotaExceeded { tag } => {
                info!(list = %self.config.list_name, %tag, "Quota condition raised");
                self.doc.add_pause_condition(&tag);
                if !self.doc.is_paused {
                    self.pause_control.close(tag.clone());
                    self.doc.mark_paused(false, Some(tag.clone()));
                }
                self.write_doc().await;
            }
            ControlRequest::QuotaCleared { tag } => {
                info!(list = %self.config.list_name, %tag, "Quota condition cleared");
                self.doc.clear_pause_condition(&tag);
                self.events.emit(SyncEvent::QuotaCleared { tag });
                // Auto-resume only when the pause was not user-initiated
                if self.doc.is_paused && !self.doc.manual_pause && self.doc.pause_conditions.is_empty() {
                    self.resume().await;
                } else {
                    self.write_doc().await;
                }
            }
            ControlRequest::RunAdHoc { name, reply } => {
                let result = self.run_ad_hoc(&name).await;
                let _ = reply.send(result);
            }
            ControlRequest::Status { reply } => {
                let view = self.project_status().await;
                let _ = reply.send(view);
            }
            ControlRequest::Shutdown { reply } => {
                // Cancels in-flight work but keeps the persisted state, so
                // the next process picks up where this one left off
                info!(list = %self.config.list_name, "Shutdown requested");
                self.cycle_cancel.cancel();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn resume(&mut self) {
        self.doc.mark_running();
        self.pause_control.open();
        self.write_doc().await;
        self.events.emit(SyncEvent::CycleResumed {
            list: self.config.list_name.clone(),
            cycle: self.doc.current_cycle,
        });
        // A paused record left from a quota pause is re-driven when the
        // cycle re-enters; nothing else to do here
    }

    /// Single-shot out-of-cycle run with single-instance enforcement
    async fn run_ad_hoc(&mut self, name: &str) -> ControlResult<String> {
        if !self.catalog.contains(name) {
            return Err(ControlError::UnknownJob(name.to_string()));
        }

        let running = self
            .state
            .find_running()
            .await
            .map_err(|e| ControlError::State(e.to_string()))?;
        if running.iter().any(|record| record.name == name) {
            warn!(%name, "run_ad_hoc: rejected, already running");
            return Err(ControlError::AdHocConflict(name.to_string()));
        }

        let record = crate::domain::JobRecord::new(
            name,
            json!({
                meta::AD_HOC: true,
                meta::NODE_ID: self.config.node_id,
            }),
        );
        let record_id = self
            .state
            .create_record(record)
            .await
            .map_err(|e| ControlError::State(e.to_string()))?;
        self.events.emit(SyncEvent::JobScheduled {
            record_id: record_id.clone(),
            name: name.to_string(),
        });

        info!(%name, %record_id, "Ad-hoc run accepted");
        let executor = self.executor.clone();
        let opts = self.exec_opts.clone();
        let cancel = self.shutdown.child_token();
        let id = record_id.clone();
        tokio::spawn(async move {
            executor.drive(&id, &opts, &cancel).await;
        });

        Ok(record_id)
    }

    async fn handle_step_signal(&mut self, signal: StepSignal) {
        match signal {
            StepSignal::Started { index, .. } => {
                self.doc.current_async_fn_index = Some(index);
                self.doc.current_async_fn = self.step_pointer(index);
                self.doc.next_async_fn = self
                    .def
                    .next_active_from(index + 1)
                    .and_then(|(next_index, _)| self.step_pointer(next_index));
                self.write_doc().await;
            }
            StepSignal::Terminal { .. } => {
                self.refresh_counters(self.doc.current_cycle).await;
                self.write_doc().await;
            }
        }
    }

    fn step_pointer(&self, index: usize) -> Option<StepPointer> {
        self.def.steps.get(index).map(|step| StepPointer {
            name: step.name.clone(),
            parallel_group: step.parallel_group.clone(),
            function_name: step.function_name.clone(),
        })
    }

    /// Recompute the derived cycle counters from live records
    async fn refresh_counters(&mut self, cycle: u32) {
        match self.state.find_by_cycle(&self.config.list_name, cycle).await {
            Ok(records) => {
                let mut latest: std::collections::HashMap<&str, JobStatus> = std::collections::HashMap::new();
                let mut live: f64 = 0.0;
                for record in &records {
                    if !latest.contains_key(record.name.as_str()) {
                        latest.insert(record.name.as_str(), record.status);
                        if matches!(record.status, JobStatus::Running | JobStatus::Retrying) {
                            live += record.progress;
                        }
                    }
                }
                let completed = latest.values().filter(|s| **s == JobStatus::Completed).count() as u32;
                let failed = latest.values().filter(|s| **s == JobStatus::Failed).count() as u32;
                let total = self.doc.total_async_fns.max(1);
                self.doc.completed_async_fns = completed;
                self.doc.failed_async_fns = failed;
                self.doc.progress = ((completed as f64 + live) / total as f64 * 100.0).clamp(0.0, 100.0);
            }
            Err(e) => warn!(error = %e, "refresh_counters: query failed"),
        }
    }

    async fn project_status(&mut self) -> ListStatusView {
        let records = self
            .state
            .find_by_cycle(&self.config.list_name, self.doc.current_cycle)
            .await
            .unwrap_or_default();
        project(&self.doc, &records, &self.def, &self.catalog, now_ms())
    }

    async fn write_doc(&mut self) {
        self.doc.total_async_fns = self.def.total_async_fns();
        self.doc.touch();
        if let Err(e) = self.state.upsert_list_status(self.doc.clone()).await {
            error!(list = %self.config.list_name, error = %e, "write_doc: status write failed");
        }
    }
}

/// Sleep until the instant, or forever when None (for use behind a select
/// guard)
async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
