//! Status projection
//!
//! Builds the JSON document the status endpoint serves. Everything derived
//! is recomputed from live job records on each call; the stored progress
//! fields in the status document are never trusted. The workflow definition
//! is authoritative for step count and ordering.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::JobCatalog;
use crate::domain::{JobRecord, JobStatus, ListStatus, OverallStatus, WorkflowDefinition};

/// Default interval shown before the list is initialised (24h in ms)
pub const DEFAULT_CYCLE_INTERVAL_MS: i64 = 24 * 3600 * 1000;

/// One step as rendered in timeline/current/next slots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepView {
    pub name: String,
    pub display_name: String,
    pub function_name: String,
    /// Record status, or "pending" when the step has no record this cycle
    pub status: String,
    pub progress_percentage: f64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub scheduled_at: Option<i64>,
    pub machine_name: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
    /// Position in the workflow definition
    pub index: usize,
}

/// Progress through the current cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleProgressView {
    /// Steps finished (completed or failed)
    pub current: u32,
    pub total: u32,
    pub percentage: f64,
    pub completed: u32,
    pub remaining: u32,
}

/// Record counts per status for the current cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusBreakdown {
    pub running: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub paused: u32,
    pub retrying: u32,
    pub pending: u32,
    pub skipped: u32,
}

/// The full status document served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListStatusView {
    pub name: String,
    pub overall_status: OverallStatus,
    pub is_running: bool,
    pub is_paused: bool,
    pub manual_pause: bool,
    pub pause_reason: Option<String>,
    pub stop_reason: Option<String>,

    pub current_cycle: u32,
    pub total_cycles: u32,
    pub max_cycles: Option<u32>,
    pub cycle_interval: Option<i64>,

    pub total_async_fns: u32,
    pub completed_async_fns: u32,
    pub failed_async_fns: u32,
    pub current_async_fn_index: Option<usize>,
    /// 0-100 float
    pub progress: f64,

    pub previous_async_fn: Option<StepView>,
    pub current_async_fn: Option<StepView>,
    pub next_async_fn: Option<StepView>,

    pub pause_conditions: Vec<String>,
    pub continue_conditions: Vec<String>,
    pub next_cycle_scheduled: Option<i64>,

    pub status_text: String,
    /// green | yellow | red | blue | gray
    pub status_color: String,
    /// progress rounded to an integer
    pub progress_percentage: i64,
    /// "3h 17m", "Now", or null
    pub time_until_next_cycle: Option<String>,

    pub cycle_progress: CycleProgressView,
    pub job_timeline: Vec<StepView>,
    pub job_status_breakdown: JobStatusBreakdown,
}

/// Fixed document returned when no status exists yet
pub fn not_initialized(name: &str) -> ListStatusView {
    ListStatusView {
        name: name.to_string(),
        overall_status: OverallStatus::NotInitialized,
        is_running: false,
        is_paused: false,
        manual_pause: false,
        pause_reason: None,
        stop_reason: None,
        current_cycle: 0,
        total_cycles: 0,
        max_cycles: None,
        cycle_interval: Some(DEFAULT_CYCLE_INTERVAL_MS),
        total_async_fns: 0,
        completed_async_fns: 0,
        failed_async_fns: 0,
        current_async_fn_index: None,
        progress: 0.0,
        previous_async_fn: None,
        current_async_fn: None,
        next_async_fn: None,
        pause_conditions: Vec::new(),
        continue_conditions: Vec::new(),
        next_cycle_scheduled: None,
        status_text: "Not Initialized".to_string(),
        status_color: "gray".to_string(),
        progress_percentage: 0,
        time_until_next_cycle: None,
        cycle_progress: CycleProgressView {
            current: 0,
            total: 0,
            percentage: 0.0,
            completed: 0,
            remaining: 0,
        },
        job_timeline: Vec::new(),
        job_status_breakdown: JobStatusBreakdown::default(),
    }
}

/// Project the full status view
///
/// `records` are the job records of the current cycle, most recent first.
pub fn project(
    doc: &ListStatus,
    records: &[JobRecord],
    def: &WorkflowDefinition,
    catalog: &JobCatalog,
    now: i64,
) -> ListStatusView {
    // Latest record per function name
    let mut latest: std::collections::HashMap<&str, &JobRecord> = std::collections::HashMap::new();
    for record in records {
        latest.entry(record.name.as_str()).or_insert(record);
    }

    let timeline: Vec<StepView> = def
        .active_steps()
        .map(|(index, step)| {
            let record = latest.get(step.function_name.as_str()).copied();
            step_view(index, &step.name, &step.function_name, record, catalog)
        })
        .collect();

    let total = def.total_async_fns();
    let completed = timeline.iter().filter(|s| s.status == "completed").count() as u32;
    let failed = timeline.iter().filter(|s| s.status == "failed").count() as u32;
    let finished = completed + failed;

    // Derived progress: one unit per completed step plus fractional credit
    // for live steps
    let live_progress: f64 = timeline
        .iter()
        .filter(|s| s.status == "running" || s.status == "retrying")
        .map(|s| s.progress_percentage / 100.0)
        .sum();
    let progress = if total == 0 {
        if doc.overall_status == OverallStatus::Completed { 100.0 } else { 0.0 }
    } else {
        ((completed as f64 + live_progress) / total as f64 * 100.0).clamp(0.0, 100.0)
    };

    // Current step: a live record wins; otherwise the stored index (pause
    // bookkeeping); otherwise the first step not yet terminal
    let current_index = timeline
        .iter()
        .find(|s| matches!(s.status.as_str(), "running" | "retrying" | "paused"))
        .map(|s| s.index)
        .or(doc.current_async_fn_index)
        .or_else(|| {
            if doc.overall_status == OverallStatus::Running {
                timeline
                    .iter()
                    .find(|s| matches!(s.status.as_str(), "pending" | "scheduled"))
                    .map(|s| s.index)
            } else {
                None
            }
        });

    let current_async_fn = current_index.and_then(|idx| timeline.iter().find(|s| s.index == idx)).cloned();
    let previous_async_fn = current_index
        .and_then(|idx| {
            timeline
                .iter()
                .filter(|s| s.index < idx && matches!(s.status.as_str(), "completed" | "failed" | "cancelled"))
                .max_by_key(|s| s.index)
        })
        .cloned();
    let next_async_fn = current_index
        .and_then(|idx| timeline.iter().find(|s| s.index > idx))
        .cloned();

    let breakdown = breakdown(def, &timeline, records);

    let time_until_next_cycle = doc.next_cycle_scheduled.map(|at| format_time_until(at - now));

    ListStatusView {
        name: doc.name.clone(),
        overall_status: doc.overall_status,
        is_running: doc.is_running,
        is_paused: doc.is_paused,
        manual_pause: doc.manual_pause,
        pause_reason: doc.pause_reason.clone(),
        stop_reason: doc.stop_reason.clone(),
        current_cycle: doc.current_cycle,
        total_cycles: doc.total_cycles,
        max_cycles: doc.max_cycles,
        cycle_interval: doc.cycle_interval_ms,
        total_async_fns: total,
        completed_async_fns: completed,
        failed_async_fns: failed,
        current_async_fn_index: current_index,
        progress,
        previous_async_fn,
        current_async_fn,
        next_async_fn,
        pause_conditions: doc.pause_conditions.clone(),
        continue_conditions: doc.continue_conditions.clone(),
        next_cycle_scheduled: doc.next_cycle_scheduled,
        status_text: status_text(doc),
        status_color: status_color(doc.overall_status).to_string(),
        progress_percentage: progress.round() as i64,
        time_until_next_cycle,
        cycle_progress: CycleProgressView {
            current: finished,
            total,
            percentage: progress,
            completed,
            remaining: total.saturating_sub(finished),
        },
        job_timeline: timeline,
        job_status_breakdown: breakdown,
    }
}

fn step_view(
    index: usize,
    step_name: &str,
    function_name: &str,
    record: Option<&JobRecord>,
    catalog: &JobCatalog,
) -> StepView {
    let display_name = catalog
        .lookup(function_name)
        .map(|spec| spec.display_name.clone())
        .unwrap_or_else(|| step_name.to_string());

    match record {
        Some(record) => StepView {
            name: step_name.to_string(),
            display_name,
            function_name: function_name.to_string(),
            status: record.status.to_string(),
            progress_percentage: (record.progress * 100.0).clamp(0.0, 100.0),
            started_at: record.started_at,
            ended_at: record.ended_at,
            scheduled_at: Some(record.scheduled_at),
            machine_name: record.machine_name.clone(),
            error_message: record.error.clone(),
            result: record.result.clone(),
            index,
        },
        None => StepView {
            name: step_name.to_string(),
            display_name,
            function_name: function_name.to_string(),
            status: "pending".to_string(),
            progress_percentage: 0.0,
            started_at: None,
            ended_at: None,
            scheduled_at: None,
            machine_name: None,
            error_message: None,
            result: None,
            index,
        },
    }
}

fn breakdown(def: &WorkflowDefinition, timeline: &[StepView], records: &[JobRecord]) -> JobStatusBreakdown {
    let mut out = JobStatusBreakdown::default();
    for step in timeline {
        match step.status.as_str() {
            "running" => out.running += 1,
            "completed" => out.completed += 1,
            "failed" => out.failed += 1,
            "cancelled" => out.cancelled += 1,
            "paused" => out.paused += 1,
            "retrying" => out.retrying += 1,
            // Scheduled records have not made progress yet
            "pending" | "scheduled" => out.pending += 1,
            "skipped" => out.skipped += 1,
            _ => {}
        }
    }
    // Skipped steps surface through their records (or the definition, when
    // the cycle has not reached them)
    let skipped_recorded = records.iter().filter(|r| r.status == JobStatus::Skipped).count() as u32;
    let skipped_defined = def.steps.iter().filter(|s| s.skipped).count() as u32;
    out.skipped = skipped_recorded.max(skipped_defined);
    out
}

fn status_text(doc: &ListStatus) -> String {
    match doc.overall_status {
        OverallStatus::NotInitialized => "Not Initialized".to_string(),
        OverallStatus::Running => format!("Running cycle {}", doc.current_cycle),
        OverallStatus::Paused => match &doc.pause_reason {
            Some(reason) => format!("Paused: {}", reason),
            None => "Paused".to_string(),
        },
        OverallStatus::Stopped => "Stopped".to_string(),
        OverallStatus::Completed => "Completed".to_string(),
    }
}

fn status_color(status: OverallStatus) -> &'static str {
    match status {
        OverallStatus::Running => "green",
        OverallStatus::Paused => "yellow",
        OverallStatus::Stopped => "red",
        OverallStatus::Completed => "blue",
        OverallStatus::NotInitialized => "gray",
    }
}

/// Human-friendly countdown: "2d 3h", "3h 17m", "17m", or "Now"
pub fn format_time_until(ms: i64) -> String {
    if ms <= 0 {
        return "Now".to_string();
    }
    let total_minutes = ms / 60_000;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes.max(1))
    }
}
