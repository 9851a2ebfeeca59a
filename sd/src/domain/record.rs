//! JobRecord domain type
//!
//! One document per execution attempt of a named job. Records are created
//! `scheduled`, walk the transition graph below, and are never mutated after
//! reaching a terminal status (administrative deletion aside).
//!
//! ```text
//! scheduled -> running -> completed | failed | cancelled
//!                 |-> paused -> retrying -> running
//!                 |-> retrying -> running
//! scheduled -> skipped | cancelled
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use jobstore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Metadata keys the orchestrator stamps onto records
///
/// Keys are camelCase because metadata flows unmodified into the status
/// endpoint payloads.
pub mod meta {
    pub const CYCLED_LIST_NAME: &str = "cycledListName";
    pub const CYCLE_NUMBER: &str = "cycleNumber";
    pub const NODE_ID: &str = "nodeId";
    pub const PARALLEL_GROUP: &str = "parallelGroup";
    pub const AD_HOC: &str = "adHoc";
}

/// Job record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record created, not yet started
    #[default]
    Scheduled,
    /// Job function executing
    Running,
    /// Finished successfully
    Completed,
    /// Retries exhausted or fatal error
    Failed,
    /// Suspended by a quota condition; resumable
    Paused,
    /// Cancelled by stop, manual action, or timeout
    Cancelled,
    /// Backing off before the next attempt
    Retrying,
    /// Excluded by the workflow definition; never ran
    Skipped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "retrying" => Ok(Self::Retrying),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("Unknown job status: {}", other)),
        }
    }
}

impl JobStatus {
    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped)
    }

    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, to),
            (Scheduled, Running)
                | (Scheduled, Skipped)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Running)
                | (Retrying, Cancelled)
                | (Paused, Retrying)
                | (Paused, Cancelled)
        )
    }
}

/// Severity of a job log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One appended log line on a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: i64,
    pub level: LogLevel,
    pub msg: String,
}

impl LogEntry {
    pub fn info(msg: impl Into<String>) -> Self {
        Self {
            ts: now_ms(),
            level: LogLevel::Info,
            msg: msg.into(),
        }
    }

    pub fn warn(msg: impl Into<String>) -> Self {
        Self {
            ts: now_ms(),
            level: LogLevel::Warn,
            msg: msg.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ts: now_ms(),
            level: LogLevel::Error,
            msg: msg.into(),
        }
    }
}

/// One execution attempt of a named job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique identifier
    pub id: String,

    /// Job name; matches a key in the job catalogue
    pub name: String,

    /// Host that ran this attempt
    #[serde(default)]
    pub machine_name: Option<String>,

    /// Current status
    pub status: JobStatus,

    /// When the record was scheduled (Unix ms)
    pub scheduled_at: i64,

    /// Set on transition to running/retrying
    #[serde(default)]
    pub started_at: Option<i64>,

    /// Set on any terminal transition
    #[serde(default)]
    pub ended_at: Option<i64>,

    /// Fraction in [0, 1]; non-decreasing within one attempt
    pub progress: f64,

    /// Opaque success payload
    #[serde(default)]
    pub result: Option<Value>,

    /// Short error message
    #[serde(default)]
    pub error: Option<String>,

    /// Structured error object
    #[serde(default)]
    pub error_details: Option<Value>,

    /// Appended lazily during execution
    #[serde(default)]
    pub logs: Vec<LogEntry>,

    /// Free-form; carries cycledListName/cycleNumber/nodeId for cycle runs
    pub metadata: Value,

    /// For ad-hoc scheduled runs
    #[serde(default)]
    pub cron_expression: Option<String>,

    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub next_run: Option<i64>,

    /// Creation timestamp (Unix ms)
    pub created_at: i64,

    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl JobRecord {
    /// Create a new scheduled record
    pub fn new(name: impl Into<String>, metadata: Value) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("job"),
            name: name.into(),
            machine_name: None,
            status: JobStatus::Scheduled,
            scheduled_at: now,
            started_at: None,
            ended_at: None,
            progress: 0.0,
            result: None,
            error: None,
            error_details: None,
            logs: Vec::new(),
            metadata,
            cron_expression: None,
            timezone: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a record already in `skipped` state (never executed)
    pub fn new_skipped(name: impl Into<String>, metadata: Value) -> Self {
        let mut record = Self::new(name, metadata);
        record.status = JobStatus::Skipped;
        record.ended_at = Some(record.created_at);
        record
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn append_log(&mut self, entry: LogEntry) {
        self.logs.push(entry);
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Cycled list name from metadata, if stamped
    pub fn cycled_list_name(&self) -> Option<&str> {
        self.metadata.get(meta::CYCLED_LIST_NAME).and_then(|v| v.as_str())
    }

    /// Cycle number from metadata, if stamped
    pub fn cycle_number(&self) -> Option<i64> {
        self.metadata.get(meta::CYCLE_NUMBER).and_then(|v| v.as_i64())
    }

    /// Parallel group from metadata, if stamped
    pub fn parallel_group(&self) -> Option<&str> {
        self.metadata.get(meta::PARALLEL_GROUP).and_then(|v| v.as_str())
    }

    /// Whether this record was created by `run now` rather than a cycle
    pub fn is_ad_hoc(&self) -> bool {
        self.metadata.get(meta::AD_HOC).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Shallow-merge a patch object into metadata
    pub fn merge_metadata(&mut self, patch: &Value) {
        if self.metadata.is_null() {
            self.metadata = serde_json::json!({});
        }
        if let (Some(target), Some(source)) = (self.metadata.as_object_mut(), patch.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
        self.updated_at = now_ms();
    }
}

impl Record for JobRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "job_records"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
        fields.insert("scheduled_at".to_string(), IndexValue::Int(self.scheduled_at));
        if let Some(list) = self.cycled_list_name() {
            fields.insert("cycled_list".to_string(), IndexValue::String(list.to_string()));
        }
        if let Some(cycle) = self.cycle_number() {
            fields.insert("cycle_number".to_string(), IndexValue::Int(cycle));
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cycle_metadata() -> Value {
        json!({
            meta::CYCLED_LIST_NAME: "market-sync",
            meta::CYCLE_NUMBER: 3,
            meta::NODE_ID: "node-1",
        })
    }

    #[test]
    fn test_new_record_defaults() {
        let record = JobRecord::new("sync_eod_prices", cycle_metadata());
        assert!(record.id.starts_with("job-"));
        assert_eq!(record.status, JobStatus::Scheduled);
        assert_eq!(record.progress, 0.0);
        assert!(record.started_at.is_none());
        assert!(record.ended_at.is_none());
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_new_skipped_is_terminal() {
        let record = JobRecord::new_skipped("sync_tickers", cycle_metadata());
        assert_eq!(record.status, JobStatus::Skipped);
        assert!(record.is_terminal());
        assert!(record.ended_at.is_some());
    }

    #[test]
    fn test_metadata_accessors() {
        let record = JobRecord::new("sync_eod_prices", cycle_metadata());
        assert_eq!(record.cycled_list_name(), Some("market-sync"));
        assert_eq!(record.cycle_number(), Some(3));
        assert!(!record.is_ad_hoc());
    }

    #[test]
    fn test_merge_metadata() {
        let mut record = JobRecord::new("sync_eod_prices", json!({"a": 1}));
        record.merge_metadata(&json!({meta::CYCLE_NUMBER: 7, "a": 2}));
        assert_eq!(record.cycle_number(), Some(7));
        assert_eq!(record.metadata.get("a"), Some(&json!(2)));
    }

    #[test]
    fn test_merge_metadata_into_null() {
        let mut record = JobRecord::new("sync_eod_prices", Value::Null);
        record.merge_metadata(&json!({meta::AD_HOC: true}));
        assert!(record.is_ad_hoc());
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(!JobStatus::Scheduled.is_terminal());
    }

    #[test]
    fn test_transition_graph() {
        use JobStatus::*;
        assert!(Scheduled.can_transition_to(Running));
        assert!(Scheduled.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Paused));
        assert!(Running.can_transition_to(Retrying));
        assert!(Paused.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Running));

        // No resurrection from terminal states
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Retrying));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Skipped.can_transition_to(Running));

        // No shortcuts
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Running));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&JobStatus::Retrying).unwrap();
        assert_eq!(json, r#""retrying""#);
        let status: JobStatus = serde_json::from_str(r#""skipped""#).unwrap();
        assert_eq!(status, JobStatus::Skipped);
    }

    #[test]
    fn test_indexed_fields() {
        let record = JobRecord::new("sync_eod_prices", cycle_metadata());
        let fields = record.indexed_fields();
        assert_eq!(fields.get("status"), Some(&IndexValue::String("scheduled".into())));
        assert_eq!(fields.get("name"), Some(&IndexValue::String("sync_eod_prices".into())));
        assert_eq!(fields.get("cycled_list"), Some(&IndexValue::String("market-sync".into())));
        assert_eq!(fields.get("cycle_number"), Some(&IndexValue::Int(3)));
    }

    #[test]
    fn test_indexed_fields_without_cycle() {
        let record = JobRecord::new("sync_eod_prices", json!({meta::AD_HOC: true}));
        let fields = record.indexed_fields();
        assert!(!fields.contains_key("cycled_list"));
        assert!(!fields.contains_key("cycle_number"));
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let mut record = JobRecord::new("sync_fundamentals", cycle_metadata());
        record.append_log(LogEntry::warn("rate limited, backing off"));
        let json = serde_json::to_string(&record).unwrap();
        let parsed: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.logs.len(), 1);
        assert_eq!(parsed.logs[0].level, LogLevel::Warn);
    }
}
