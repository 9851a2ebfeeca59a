//! StateManager - actor that owns the job store
//!
//! Processes commands via channels for thread-safe access to persistent
//! state. The actor is the single writer, so per-record transitions are
//! linearisable and compare-and-set conflicts can only come from commands
//! that raced each other through this queue.

use std::path::Path;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{Filter, IndexValue, JobRecord, JobStatus, ListStatus, LogEntry, Store, now_ms};

use super::messages::{StateCommand, StateError, StateResponse, TransitionPatch};

/// Event broadcast when persistent state changes
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// A new job record was created
    RecordCreated { id: String, name: String },
    /// A job record changed status or content
    RecordUpdated { id: String },
    /// The list status document was written
    StatusUpdated { name: String },
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    event_tx: tokio::sync::broadcast::Sender<StateEvent>,
}

impl StateManager {
    /// Spawn a new StateManager actor over the store at `store_path`
    pub fn spawn(store_path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "spawn: called");
        let mut store = Store::open(store_path.as_ref())?;

        // Rebuild indexes so status/name/cycle queries are trustworthy even
        // after a schema change
        let record_count = store.rebuild_indexes::<JobRecord>()?;
        let status_count = store.rebuild_indexes::<ListStatus>()?;
        info!(record_count, status_count, "Rebuilt indexes for job records and list status");

        let (tx, rx) = mpsc::channel(256);
        let (event_tx, _) = tokio::sync::broadcast::channel(64);

        let actor_events = event_tx.clone();
        tokio::spawn(actor_loop(store, rx, actor_events));

        info!("StateManager spawned");
        Ok(Self { tx, event_tx })
    }

    /// Subscribe to state change events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<StateEvent> {
        self.event_tx.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(tokio::sync::oneshot::Sender<StateResponse<T>>) -> StateCommand,
    ) -> StateResponse<T> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    // === Record lifecycle ===

    /// Create a job record; returns its id
    pub async fn create_record(&self, record: JobRecord) -> StateResponse<String> {
        debug!(record_id = %record.id, name = %record.name, status = %record.status, "create_record: called");
        self.request(|reply| StateCommand::CreateRecord { record, reply }).await
    }

    /// Get a record by id
    pub async fn get_record(&self, id: &str) -> StateResponse<Option<JobRecord>> {
        self.request(|reply| StateCommand::GetRecord { id: id.to_string(), reply })
            .await
    }

    /// Get a record by id, erroring when missing
    pub async fn get_record_required(&self, id: &str) -> Result<JobRecord, StateError> {
        self.get_record(id)
            .await?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// Compare-and-set status transition with an atomic field patch
    ///
    /// Returns the record as written. A `Conflict` error carries the status
    /// the winner left behind; the caller treats that as authoritative.
    pub async fn transition(
        &self,
        id: &str,
        from: JobStatus,
        to: JobStatus,
        patch: TransitionPatch,
    ) -> StateResponse<JobRecord> {
        debug!(%id, %from, %to, "transition: called");
        self.request(|reply| StateCommand::Transition {
            id: id.to_string(),
            from,
            to,
            patch,
            reply,
        })
        .await
    }

    /// Append a log entry to a record
    pub async fn append_log(&self, id: &str, entry: LogEntry) -> StateResponse<()> {
        self.request(|reply| StateCommand::AppendLog {
            id: id.to_string(),
            entry,
            reply,
        })
        .await
    }

    /// Set record progress; regressions are rejected
    pub async fn set_progress(&self, id: &str, value: f64) -> StateResponse<()> {
        debug!(%id, value, "set_progress: called");
        self.request(|reply| StateCommand::SetProgress {
            id: id.to_string(),
            value,
            reply,
        })
        .await
    }

    /// Shallow-merge a patch into record metadata
    pub async fn update_metadata(&self, id: &str, patch: serde_json::Value) -> StateResponse<()> {
        self.request(|reply| StateCommand::UpdateMetadata {
            id: id.to_string(),
            patch,
            reply,
        })
        .await
    }

    // === Queries ===

    /// Records for a job name, most recent first
    pub async fn find_by_name(&self, name: &str, limit: Option<usize>) -> StateResponse<Vec<JobRecord>> {
        self.request(|reply| StateCommand::FindByName {
            name: name.to_string(),
            limit,
            reply,
        })
        .await
    }

    /// All records currently in `running` status
    pub async fn find_running(&self) -> StateResponse<Vec<JobRecord>> {
        self.request(|reply| StateCommand::FindRunning { reply }).await
    }

    /// Records scheduled at or after `since`
    pub async fn find_recent(&self, since: i64) -> StateResponse<Vec<JobRecord>> {
        self.request(|reply| StateCommand::FindRecent { since, reply }).await
    }

    /// Records stamped with a given list and cycle number
    pub async fn find_by_cycle(&self, list: &str, cycle: u32) -> StateResponse<Vec<JobRecord>> {
        debug!(%list, cycle, "find_by_cycle: called");
        self.request(|reply| StateCommand::FindByCycle {
            list: list.to_string(),
            cycle,
            reply,
        })
        .await
    }

    /// Most recently finished (terminal) record for a job name
    pub async fn find_latest_finished(&self, name: &str) -> StateResponse<Option<JobRecord>> {
        self.request(|reply| StateCommand::FindLatestFinished {
            name: name.to_string(),
            reply,
        })
        .await
    }

    // === Deletion ===

    /// Delete a record by id; returns whether it existed
    pub async fn delete_record(&self, id: &str) -> StateResponse<bool> {
        self.request(|reply| StateCommand::DeleteRecord { id: id.to_string(), reply })
            .await
    }

    /// Delete every job record
    pub async fn delete_all_records(&self) -> StateResponse<usize> {
        self.request(|reply| StateCommand::DeleteAllRecords { reply }).await
    }

    // === Status document ===

    /// Write the list status document (insert or replace)
    pub async fn upsert_list_status(&self, doc: ListStatus) -> StateResponse<()> {
        debug!(name = %doc.name, overall = %doc.overall_status, "upsert_list_status: called");
        self.request(|reply| StateCommand::UpsertListStatus {
            doc: Box::new(doc),
            reply,
        })
        .await
    }

    /// Read the list status document for a name
    ///
    /// When duplicates exist (migration leftovers) the most recently
    /// updated document wins.
    pub async fn get_list_status(&self, name: &str) -> StateResponse<Option<ListStatus>> {
        self.request(|reply| StateCommand::GetListStatus {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Ask the actor to exit
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }
}

/// The actor: owns the store, drains the command queue
async fn actor_loop(
    mut store: Store,
    mut rx: mpsc::Receiver<StateCommand>,
    events: tokio::sync::broadcast::Sender<StateEvent>,
) {
    debug!("actor_loop: started");
    while let Some(command) = rx.recv().await {
        match command {
            StateCommand::CreateRecord { record, reply } => {
                let id = record.id.clone();
                let name = record.name.clone();
                let result = store
                    .insert(&record)
                    .map(|_| id.clone())
                    .map_err(|e| StateError::StoreError(e.to_string()));
                if result.is_ok() {
                    let _ = events.send(StateEvent::RecordCreated { id, name });
                }
                let _ = reply.send(result);
            }
            StateCommand::GetRecord { id, reply } => {
                let result = store
                    .get::<JobRecord>(&id)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::Transition {
                id,
                from,
                to,
                patch,
                reply,
            } => {
                let result = apply_transition(&mut store, &id, from, to, patch);
                if result.is_ok() {
                    let _ = events.send(StateEvent::RecordUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::AppendLog { id, entry, reply } => {
                let result = store
                    .mutate(&id, |record: &mut JobRecord| record.append_log(entry))
                    .map_err(|e| StateError::StoreError(e.to_string()))
                    .and_then(|r| r.map(|_| ()).ok_or(StateError::NotFound(id)));
                let _ = reply.send(result);
            }
            StateCommand::SetProgress { id, value, reply } => {
                let result = apply_progress(&mut store, &id, value);
                if result.is_ok() {
                    let _ = events.send(StateEvent::RecordUpdated { id });
                }
                let _ = reply.send(result);
            }
            StateCommand::UpdateMetadata { id, patch, reply } => {
                let result = store
                    .mutate(&id, |record: &mut JobRecord| record.merge_metadata(&patch))
                    .map_err(|e| StateError::StoreError(e.to_string()))
                    .and_then(|r| r.map(|_| ()).ok_or(StateError::NotFound(id)));
                let _ = reply.send(result);
            }
            StateCommand::FindByName { name, limit, reply } => {
                let result = store
                    .list::<JobRecord>(&[Filter::eq("name", name)], limit)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::FindRunning { reply } => {
                let result = store
                    .list::<JobRecord>(&[Filter::eq("status", "running")], None)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::FindRecent { since, reply } => {
                let result = store
                    .list::<JobRecord>(&[Filter::gte("scheduled_at", since)], None)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::FindByCycle { list, cycle, reply } => {
                let result = store
                    .list::<JobRecord>(
                        &[
                            Filter::eq("cycled_list", list),
                            Filter::eq("cycle_number", IndexValue::Int(cycle as i64)),
                        ],
                        None,
                    )
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::FindLatestFinished { name, reply } => {
                let result = store
                    .list::<JobRecord>(&[Filter::eq("name", name)], None)
                    .map(|records| records.into_iter().find(|r| r.is_terminal()))
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::DeleteRecord { id, reply } => {
                let result = store
                    .delete::<JobRecord>(&id)
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::DeleteAllRecords { reply } => {
                let result = store
                    .delete_all::<JobRecord>()
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::UpsertListStatus { doc, reply } => {
                let name = doc.name.clone();
                let exists = store.get::<ListStatus>(&name);
                let result = match exists {
                    Ok(Some(_)) => store.put(doc.as_ref()),
                    Ok(None) => store.insert(doc.as_ref()),
                    Err(e) => Err(e),
                }
                .map_err(|e| StateError::StoreError(e.to_string()));
                if result.is_ok() {
                    let _ = events.send(StateEvent::StatusUpdated { name });
                }
                let _ = reply.send(result);
            }
            StateCommand::GetListStatus { name, reply } => {
                // List rather than get: ordered by updated_at, so the most
                // recently written document wins if duplicates ever exist
                let result = store
                    .list::<ListStatus>(&[Filter::eq("name", name)], Some(1))
                    .map(|mut docs| if docs.is_empty() { None } else { Some(docs.remove(0)) })
                    .map_err(|e| StateError::StoreError(e.to_string()));
                let _ = reply.send(result);
            }
            StateCommand::Shutdown => {
                debug!("actor_loop: shutdown requested");
                break;
            }
        }
    }
    debug!("actor_loop: exited");
}

/// Perform a CAS transition with its patch inside one store transaction
fn apply_transition(
    store: &mut Store,
    id: &str,
    from: JobStatus,
    to: JobStatus,
    patch: TransitionPatch,
) -> StateResponse<JobRecord> {
    if !from.can_transition_to(to) {
        return Err(StateError::InvalidTransition { from, to });
    }

    let expected = IndexValue::String(from.to_string());
    let outcome = store
        .compare_and_update(id, "status", &expected, |record: &mut JobRecord| {
            record.status = to;
            if let Some(v) = patch.started_at {
                record.started_at = Some(v);
            }
            if let Some(v) = patch.ended_at {
                record.ended_at = Some(v);
            }
            if let Some(v) = patch.progress {
                record.progress = v;
            }
            if let Some(v) = patch.result {
                record.result = Some(v);
            }
            if let Some(v) = patch.error {
                record.error = Some(v);
            }
            if let Some(v) = patch.error_details {
                record.error_details = Some(v);
            }
            if let Some(v) = patch.machine_name {
                record.machine_name = Some(v);
            }
            if let Some(entry) = patch.log {
                record.logs.push(entry);
            }
            // Terminal bookkeeping: ended_at is set iff terminal, and
            // completed always means progress 1.0
            if to == JobStatus::Completed {
                record.progress = 1.0;
            }
            if to.is_terminal() && record.ended_at.is_none() {
                record.ended_at = Some(now_ms());
            }
            record.updated_at = now_ms();
        })
        .map_err(|e| StateError::StoreError(e.to_string()))?;

    match outcome {
        jobstore::CasOutcome::Updated => store
            .get::<JobRecord>(id)
            .map_err(|e| StateError::StoreError(e.to_string()))?
            .ok_or_else(|| StateError::NotFound(id.to_string())),
        jobstore::CasOutcome::Conflict { actual } => {
            let actual = actual.and_then(|s| s.parse::<JobStatus>().ok());
            warn!(%id, %from, %to, ?actual, "apply_transition: compare-and-set conflict");
            Err(StateError::Conflict { expected: from, actual })
        }
    }
}

/// Apply a progress write, enforcing monotonicity within an attempt
fn apply_progress(store: &mut Store, id: &str, value: f64) -> StateResponse<()> {
    let record = store
        .get::<JobRecord>(id)
        .map_err(|e| StateError::StoreError(e.to_string()))?
        .ok_or_else(|| StateError::NotFound(id.to_string()))?;

    // Progress only means something while the attempt is live; a write that
    // races its own terminal transition is dropped rather than errored
    if record.status != JobStatus::Running && record.status != JobStatus::Retrying {
        debug!(%id, status = %record.status, "apply_progress: ignored on non-live record");
        return Ok(());
    }

    // 1.0 is reserved for the completed transition
    let value = value.clamp(0.0, 0.999);
    if value < record.progress {
        return Err(StateError::ProgressRegression {
            current: record.progress,
            requested: value,
        });
    }

    store
        .mutate(id, |record: &mut JobRecord| {
            record.progress = value;
            record.updated_at = now_ms();
        })
        .map_err(|e| StateError::StoreError(e.to_string()))?
        .map(|_| ())
        .ok_or_else(|| StateError::NotFound(id.to_string()))
}
