//! ListStatus domain type
//!
//! Singleton document per cycled list, keyed by name. The cycle controller
//! is the only writer; everything else reads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use jobstore::{IndexValue, Record, now_ms};

/// Overall orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Running,
    Paused,
    Stopped,
    Completed,
    #[default]
    NotInitialized,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::NotInitialized => "not_initialized",
        };
        write!(f, "{}", s)
    }
}

/// Reference to a workflow step, as stored in the status document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPointer {
    pub name: String,
    #[serde(default)]
    pub parallel_group: Option<String>,
    pub function_name: String,
}

/// Global orchestrator state for one cycled list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListStatus {
    /// List name; doubles as the record id
    pub name: String,

    pub overall_status: OverallStatus,

    pub is_running: bool,
    pub is_paused: bool,

    /// True when the pause was user-initiated rather than quota-initiated
    pub manual_pause: bool,

    #[serde(default)]
    pub pause_reason: Option<String>,

    #[serde(default)]
    pub stop_reason: Option<String>,

    /// 1-indexed once started; 0 before the first cycle
    pub current_cycle: u32,

    /// Completed cycles
    pub total_cycles: u32,

    #[serde(default)]
    pub max_cycles: Option<u32>,

    /// Milliseconds between cycles; None means back-to-back cycles
    #[serde(default)]
    pub cycle_interval_ms: Option<i64>,

    /// Count of non-skipped workflow steps
    pub total_async_fns: u32,

    pub completed_async_fns: u32,
    pub failed_async_fns: u32,

    #[serde(default)]
    pub current_async_fn_index: Option<usize>,

    /// Cycle progress in [0, 100]
    pub progress: f64,

    #[serde(default)]
    pub current_async_fn: Option<StepPointer>,

    #[serde(default)]
    pub next_async_fn: Option<StepPointer>,

    /// Quota tags currently holding the list paused (e.g. "EODHD_DAILY_LIMIT")
    #[serde(default)]
    pub pause_conditions: Vec<String>,

    /// Quota tags whose clearing resumed the list
    #[serde(default)]
    pub continue_conditions: Vec<String>,

    #[serde(default)]
    pub next_cycle_scheduled: Option<i64>,

    pub created_at: i64,

    /// Bumped on every write
    pub last_updated: i64,
}

impl ListStatus {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            name: name.into(),
            overall_status: OverallStatus::NotInitialized,
            is_running: false,
            is_paused: false,
            manual_pause: false,
            pause_reason: None,
            stop_reason: None,
            current_cycle: 0,
            total_cycles: 0,
            max_cycles: None,
            cycle_interval_ms: None,
            total_async_fns: 0,
            completed_async_fns: 0,
            failed_async_fns: 0,
            current_async_fn_index: None,
            progress: 0.0,
            current_async_fn: None,
            next_async_fn: None,
            pause_conditions: Vec::new(),
            continue_conditions: Vec::new(),
            next_cycle_scheduled: None,
            created_at: now,
            last_updated: now,
        }
    }

    /// Flip to running, clearing pause/stop bookkeeping
    pub fn mark_running(&mut self) {
        self.overall_status = OverallStatus::Running;
        self.is_running = true;
        self.is_paused = false;
        self.manual_pause = false;
        self.pause_reason = None;
        self.stop_reason = None;
        self.touch();
    }

    /// Flip to paused; `manual` distinguishes user pauses from quota pauses
    pub fn mark_paused(&mut self, manual: bool, reason: Option<String>) {
        self.overall_status = OverallStatus::Paused;
        self.is_paused = true;
        self.is_running = false;
        self.manual_pause = manual;
        self.pause_reason = reason;
        self.touch();
    }

    pub fn mark_stopped(&mut self, reason: Option<String>) {
        self.overall_status = OverallStatus::Stopped;
        self.is_running = false;
        self.is_paused = false;
        self.stop_reason = reason;
        self.next_cycle_scheduled = None;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.overall_status = OverallStatus::Completed;
        self.is_running = false;
        self.is_paused = false;
        self.next_cycle_scheduled = None;
        self.touch();
    }

    /// Record a quota condition; keeps the list unique
    pub fn add_pause_condition(&mut self, tag: &str) {
        if !self.pause_conditions.iter().any(|t| t == tag) {
            self.pause_conditions.push(tag.to_string());
        }
        self.touch();
    }

    /// Clear a quota condition, remembering it in continue_conditions
    pub fn clear_pause_condition(&mut self, tag: &str) {
        self.pause_conditions.retain(|t| t != tag);
        if !self.continue_conditions.iter().any(|t| t == tag) {
            self.continue_conditions.push(tag.to_string());
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = now_ms();
    }
}

impl Record for ListStatus {
    fn id(&self) -> &str {
        &self.name
    }

    fn updated_at(&self) -> i64 {
        self.last_updated
    }

    fn collection_name() -> &'static str {
        "cycled_list_status"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
        fields.insert(
            "overall_status".to_string(),
            IndexValue::String(self.overall_status.to_string()),
        );
        fields
    }
}
