//! Workflow engine
//!
//! Drives one pass over the workflow definition: dependency order between
//! groups, fan-out within parallel groups, skip flags, pause-gate checks at
//! group boundaries, and resume without re-executing steps already terminal
//! for the cycle. Step failures are recorded and the cycle continues; only
//! pause and cancellation propagate out.

mod gate;

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tokio_util::sync::CancellationToken;

use crate::domain::{JobRecord, JobStatus, WorkflowDefinition, WorkflowStep, meta};
use crate::events::{EventBus, SyncEvent};
use crate::executor::{ExecOptions, JobExecutor, JobRunRequest, Outcome};
use crate::state::StateManager;

pub use gate::{PauseControl, PauseGate, pause_gate};

/// Result of one cycle pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every group ran to its end
    Finished,
    /// Progress halted at a group boundary or on a quota pause
    Paused { step_index: usize, reason: String },
    /// The cancellation token fired
    Cancelled,
}

/// Step activity notifications for the status writer
#[derive(Debug, Clone)]
pub enum StepSignal {
    Started { index: usize, name: String },
    Terminal { index: usize, name: String },
}

/// Context for one cycle pass
#[derive(Clone)]
pub struct CycleContext {
    pub cancel: CancellationToken,
    pub gate: PauseGate,
    pub node_id: String,
    /// Step transitions flow to the cycle controller, which owns all
    /// status-document writes
    pub step_tx: Option<mpsc::UnboundedSender<StepSignal>>,
}

impl CycleContext {
    fn signal(&self, signal: StepSignal) {
        if let Some(tx) = &self.step_tx {
            let _ = tx.send(signal);
        }
    }
}

/// Executes single cycles over a workflow definition
#[derive(Clone)]
pub struct WorkflowEngine {
    state: StateManager,
    executor: JobExecutor,
    events: std::sync::Arc<EventBus>,
    opts: ExecOptions,
}

impl WorkflowEngine {
    pub fn new(
        state: StateManager,
        executor: JobExecutor,
        events: std::sync::Arc<EventBus>,
        opts: ExecOptions,
    ) -> Self {
        Self {
            state,
            executor,
            events,
            opts,
        }
    }

    /// Run one cycle, resuming past any step already terminal for it
    pub async fn run_cycle(&self, def: &WorkflowDefinition, cycle: u32, ctx: &CycleContext) -> CycleOutcome {
        debug!(list = %def.name, cycle, "run_cycle: called");

        // Records already written for this cycle (resume path); latest per
        // function name wins
        let mut existing: HashMap<String, JobRecord> = HashMap::new();
        match self.state.find_by_cycle(&def.name, cycle).await {
            Ok(records) => {
                for record in records {
                    existing.entry(record.name.clone()).or_insert(record);
                }
            }
            Err(e) => warn!(error = %e, "run_cycle: could not load prior records, treating cycle as fresh"),
        }
        if !existing.is_empty() {
            debug!(count = existing.len(), "run_cycle: resuming with prior records");
        }

        for group in def.groups() {
            if ctx.cancel.is_cancelled() {
                debug!(list = %def.name, cycle, "run_cycle: cancelled at group boundary");
                return CycleOutcome::Cancelled;
            }

            // Pause gate check before starting the group; pending steps get
            // no records
            if let Some(reason) = ctx.gate.closed_reason() {
                let step_index = group
                    .steps
                    .iter()
                    .find(|(_, step)| !self.step_done(step, &existing))
                    .map(|(index, _)| *index)
                    .unwrap_or_else(|| group.steps[0].0);
                debug!(list = %def.name, cycle, step_index, %reason, "run_cycle: gate closed at group boundary");
                return CycleOutcome::Paused { step_index, reason };
            }

            let outcomes = self.run_group(def, cycle, &group.steps, ctx, &existing).await;

            // Quota pause wins over everything else in the group
            if let Some((index, reason)) = outcomes.iter().find_map(|(index, outcome)| match outcome {
                Outcome::Paused(reason) => Some((*index, reason.clone())),
                _ => None,
            }) {
                info!(list = %def.name, cycle, step_index = index, %reason, "run_cycle: paused by step");
                return CycleOutcome::Paused { step_index: index, reason };
            }

            if ctx.cancel.is_cancelled() && outcomes.iter().any(|(_, o)| o.is_cancelled()) {
                debug!(list = %def.name, cycle, "run_cycle: cancelled during group");
                return CycleOutcome::Cancelled;
            }

            // Failed steps are tolerated; the cycle continues
        }

        debug!(list = %def.name, cycle, "run_cycle: finished");
        CycleOutcome::Finished
    }

    /// Whether a step needs no further work this cycle
    fn step_done(&self, step: &WorkflowStep, existing: &HashMap<String, JobRecord>) -> bool {
        existing.get(&step.function_name).is_some_and(|record| {
            matches!(
                record.status,
                JobStatus::Completed | JobStatus::Skipped | JobStatus::Failed
            )
        })
    }

    async fn run_group(
        &self,
        def: &WorkflowDefinition,
        cycle: u32,
        steps: &[(usize, WorkflowStep)],
        ctx: &CycleContext,
        existing: &HashMap<String, JobRecord>,
    ) -> Vec<(usize, Outcome)> {
        let mut outcomes = Vec::new();
        let mut tasks: JoinSet<(usize, Outcome)> = JoinSet::new();
        let parallel = steps.len() > 1;

        for (index, step) in steps {
            let index = *index;

            if step.skipped {
                outcomes.push((index, self.record_skip(def, cycle, step, ctx, existing).await));
                continue;
            }

            // Terminal records short-circuit; a cancelled record from an
            // interrupted run gets a fresh attempt; anything live is
            // re-driven
            let resume_id = match existing.get(&step.function_name) {
                Some(record) => match record.status {
                    JobStatus::Completed => {
                        outcomes.push((index, Outcome::Completed(record.result.clone().unwrap_or_default())));
                        continue;
                    }
                    JobStatus::Skipped => {
                        outcomes.push((index, Outcome::Skipped("already skipped".to_string())));
                        continue;
                    }
                    JobStatus::Failed => {
                        outcomes.push((
                            index,
                            Outcome::Failed(record.error.clone().unwrap_or_else(|| "failed".to_string())),
                        ));
                        continue;
                    }
                    JobStatus::Cancelled => None,
                    _ => Some(record.id.clone()),
                },
                None => None,
            };

            let executor = self.executor.clone();
            let opts = self.opts.clone();
            let cancel = ctx.cancel.clone();
            let step_ctx = ctx.clone();
            let step_name = step.name.clone();
            let request = JobRunRequest {
                function_name: step.function_name.clone(),
                metadata: self.step_metadata(def, cycle, step, ctx),
            };
            step_ctx.signal(StepSignal::Started {
                index,
                name: step_name.clone(),
            });
            let fut = async move {
                let outcome = match resume_id {
                    Some(record_id) => executor.drive(&record_id, &opts, &cancel).await,
                    None => executor.run(request, &opts, &cancel).await.outcome,
                };
                step_ctx.signal(StepSignal::Terminal {
                    index,
                    name: step_name,
                });
                (index, outcome)
            };
            if parallel {
                tasks.spawn(fut);
            } else {
                outcomes.push(fut.await);
            }
        }

        // Parallel members all reach a terminal state before the group ends
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => outcomes.push(result),
                Err(e) => {
                    warn!(error = %e, "run_group: step task panicked");
                }
            }
        }

        outcomes
    }

    fn step_metadata(
        &self,
        def: &WorkflowDefinition,
        cycle: u32,
        step: &WorkflowStep,
        ctx: &CycleContext,
    ) -> serde_json::Value {
        let mut metadata = json!({
            meta::CYCLED_LIST_NAME: def.name,
            meta::CYCLE_NUMBER: cycle,
            meta::NODE_ID: ctx.node_id,
            "stepName": step.name,
        });
        if let Some(group) = &step.parallel_group {
            metadata[meta::PARALLEL_GROUP] = json!(group);
        }
        metadata
    }

    /// Write (once) a skipped record for a skipped step
    async fn record_skip(
        &self,
        def: &WorkflowDefinition,
        cycle: u32,
        step: &WorkflowStep,
        ctx: &CycleContext,
        existing: &HashMap<String, JobRecord>,
    ) -> Outcome {
        if existing.contains_key(&step.function_name) {
            return Outcome::Skipped("already recorded".to_string());
        }
        let record = JobRecord::new_skipped(&step.function_name, self.step_metadata(def, cycle, step, ctx));
        let record_id = record.id.clone();
        match self.state.create_record(record).await {
            Ok(_) => {
                self.events.emit(SyncEvent::JobSkipped {
                    record_id,
                    name: step.function_name.clone(),
                });
            }
            Err(e) => warn!(function = %step.function_name, error = %e, "record_skip: write failed"),
        }
        Outcome::Skipped("skipped by definition".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{JobCatalog, JobContext, JobError, JobFn, JobSpec};
    use crate::events::create_event_bus;
    use crate::executor::RetryPolicy;
    use crate::provider::MockProvider;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Records invocation order and concurrency
    #[derive(Default)]
    struct Probe {
        running: AtomicU32,
        max_running: AtomicU32,
        calls: AtomicU32,
    }

    struct ProbedJob {
        probe: Arc<Probe>,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl JobFn for ProbedJob {
        async fn run(&self, _ctx: JobContext) -> Result<Value, JobError> {
            self.probe.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.probe.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(JobError::fatal("probe failure"))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        state: StateManager,
        engine: WorkflowEngine,
    }

    async fn fixture(jobs: Vec<(&str, Arc<dyn JobFn>)>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::spawn(dir.path().join("state.db")).unwrap();
        let mut catalog = JobCatalog::new();
        for (name, func) in jobs {
            catalog.register(JobSpec {
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
            })
            .unwrap();
        }
        let events = create_event_bus();
        let executor = JobExecutor::new(
            state.clone(),
            Arc::new(catalog),
            Arc::new(MockProvider::new()),
            events.clone(),
            "test-host",
        );
        let opts = ExecOptions {
            retry: RetryPolicy {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            timeout: None,
        };
        let engine = WorkflowEngine::new(state.clone(), executor, events, opts);
        Fixture {
            _dir: dir,
            state,
            engine,
        }
    }

    fn ctx() -> (PauseControl, CycleContext) {
        let (control, gate) = pause_gate();
        (
            control,
            CycleContext {
                cancel: CancellationToken::new(),
                gate,
                node_id: "node-1".into(),
                step_tx: None,
            },
        )
    }

    fn quick(probe: &Arc<Probe>) -> Arc<dyn JobFn> {
        Arc::new(ProbedJob {
            probe: probe.clone(),
            delay_ms: 10,
            fail: false,
        })
    }

    #[tokio::test]
    async fn test_sequential_cycle_finishes() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![("fa", quick(&probe)), ("fb", quick(&probe)), ("fc", quick(&probe))]).await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![
                WorkflowStep::new("A", "fa"),
                WorkflowStep::new("B", "fb"),
                WorkflowStep::new("C", "fc"),
            ],
        );
        let (_control, context) = ctx();

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Finished);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        // Sequential steps never overlapped
        assert_eq!(probe.max_running.load(Ordering::SeqCst), 1);

        let records = fx.state.find_by_cycle("market-sync", 1).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == JobStatus::Completed));
        assert!(records.iter().all(|r| r.cycle_number() == Some(1)));
    }

    #[tokio::test]
    async fn test_parallel_group_overlaps() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![
            ("fa", quick(&probe)),
            ("fb", quick(&probe)),
            ("fc", quick(&probe)),
            ("fd", quick(&probe)),
        ])
        .await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![
                WorkflowStep::new("A", "fa"),
                WorkflowStep::new("B", "fb").in_group("g"),
                WorkflowStep::new("C", "fc").in_group("g"),
                WorkflowStep::new("D", "fd"),
            ],
        );
        let (_control, context) = ctx();

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Finished);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        // B and C ran concurrently
        assert_eq!(probe.max_running.load(Ordering::SeqCst), 2);

        let records = fx.state.find_by_cycle("market-sync", 1).await.unwrap();
        assert_eq!(records.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_cycle() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![
            ("fa", quick(&probe)),
            (
                "fb",
                Arc::new(ProbedJob {
                    probe: probe.clone(),
                    delay_ms: 1,
                    fail: true,
                }) as Arc<dyn JobFn>,
            ),
            ("fc", quick(&probe)),
        ])
        .await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![
                WorkflowStep::new("A", "fa"),
                WorkflowStep::new("B", "fb"),
                WorkflowStep::new("C", "fc"),
            ],
        );
        let (_control, context) = ctx();

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Finished);

        let records = fx.state.find_by_cycle("market-sync", 1).await.unwrap();
        let by_name: HashMap<_, _> = records.iter().map(|r| (r.name.as_str(), r.status)).collect();
        assert_eq!(by_name["fa"], JobStatus::Completed);
        assert_eq!(by_name["fb"], JobStatus::Failed);
        assert_eq!(by_name["fc"], JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_skipped_step_recorded_not_executed() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![("fa", quick(&probe)), ("fb", quick(&probe)), ("fc", quick(&probe))]).await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![
                WorkflowStep::new("A", "fa"),
                WorkflowStep::new("B", "fb").skipped(),
                WorkflowStep::new("C", "fc"),
            ],
        );
        let (_control, context) = ctx();

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Finished);
        // fb never invoked
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);

        let records = fx.state.find_by_cycle("market-sync", 1).await.unwrap();
        let skipped: Vec<_> = records.iter().filter(|r| r.status == JobStatus::Skipped).collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "fb");
        assert!(skipped[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_gate_closed_pauses_before_group() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![("fa", quick(&probe)), ("fb", quick(&probe))]).await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![WorkflowStep::new("A", "fa"), WorkflowStep::new("B", "fb")],
        );
        let (control, context) = ctx();
        control.close("maintenance");

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(
            outcome,
            CycleOutcome::Paused {
                step_index: 0,
                reason: "maintenance".into()
            }
        );
        // Nothing ran, no records for pending steps
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        assert!(fx.state.find_by_cycle("market-sync", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_terminal_steps() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![("fa", quick(&probe)), ("fb", quick(&probe)), ("fc", quick(&probe))]).await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![
                WorkflowStep::new("A", "fa"),
                WorkflowStep::new("B", "fb"),
                WorkflowStep::new("C", "fc"),
            ],
        );

        // First pass runs only A, then the gate closes
        let (control, context) = ctx();
        let engine = fx.engine.clone();
        let def_clone = def.clone();
        let ctx_clone = context.clone();
        let first = tokio::spawn(async move { engine.run_cycle(&def_clone, 1, &ctx_clone).await });
        tokio::time::sleep(Duration::from_millis(15)).await;
        control.close("maintenance");
        let outcome = first.await.unwrap();
        match outcome {
            CycleOutcome::Paused { step_index, .. } => assert!(step_index >= 1),
            other => panic!("Expected Paused, got {:?}", other),
        }
        let calls_after_pause = probe.calls.load(Ordering::SeqCst);

        // Resume finishes the remaining steps without re-running A
        control.open();
        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Finished);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        assert!(calls_after_pause < 3);

        let records = fx.state.find_by_cycle("market-sync", 1).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_cancellation_stops_cycle() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![
            (
                "fa",
                Arc::new(ProbedJob {
                    probe: probe.clone(),
                    delay_ms: 200,
                    fail: false,
                }) as Arc<dyn JobFn>,
            ),
            ("fb", quick(&probe)),
        ])
        .await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![WorkflowStep::new("A", "fa"), WorkflowStep::new("B", "fb")],
        );
        let (_control, context) = ctx();

        let canceller = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Cancelled);
        // B never started
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_skipped_cycle_finishes_instantly() {
        let fx = fixture(vec![]).await;
        let def = WorkflowDefinition::new(
            "market-sync",
            vec![
                WorkflowStep::new("A", "fa").skipped(),
                WorkflowStep::new("B", "fb").skipped(),
            ],
        );
        let (_control, context) = ctx();

        let outcome = fx.engine.run_cycle(&def, 1, &context).await;
        assert_eq!(outcome, CycleOutcome::Finished);
        let records = fx.state.find_by_cycle("market-sync", 1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == JobStatus::Skipped));
    }

    #[tokio::test]
    async fn test_step_signals_emitted() {
        let probe = Arc::new(Probe::default());
        let fx = fixture(vec![("fa", quick(&probe))]).await;
        let def = WorkflowDefinition::new("market-sync", vec![WorkflowStep::new("A", "fa")]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_control, gate) = pause_gate();
        let context = CycleContext {
            cancel: CancellationToken::new(),
            gate,
            node_id: "node-1".into(),
            step_tx: Some(tx),
        };

        fx.engine.run_cycle(&def, 1, &context).await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, StepSignal::Started { index: 0, .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, StepSignal::Terminal { index: 0, .. }));
    }
}
