//! JSONL event logger
//!
//! Subscribes to the event bus and appends one JSON line per event to the
//! activity log under the data directory.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bus::EventBus;
use super::types::SyncEvent;
use jobstore::now_ms;

/// One line of the activity log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub ts: i64,
    #[serde(flatten)]
    pub event: SyncEvent,
}

/// Spawn a background task writing events to `path` as JSONL
///
/// Returns the task handle; the task ends when the bus is dropped.
pub fn spawn_event_logger(bus: Arc<EventBus>, path: PathBuf) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %e, "event logger: cannot create log directory");
                return;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "event logger: cannot open log file");
                return;
            }
        };

        loop {
            match rx.recv().await {
                Ok(event) => {
                    let entry = EventLogEntry { ts: now_ms(), event };
                    match serde_json::to_string(&entry) {
                        Ok(mut line) => {
                            line.push('\n');
                            if let Err(e) = file.write_all(line.as_bytes()).await {
                                warn!(error = %e, "event logger: write failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "event logger: serialize failed"),
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    debug!(missed = n, "event logger: lagged, continuing");
                }
                Err(RecvError::Closed) => {
                    debug!("event logger: bus closed, exiting");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::create_event_bus;

    #[tokio::test]
    async fn test_logger_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let bus = create_event_bus();
        let handle = spawn_event_logger(bus.clone(), path.clone());

        // Give the logger a moment to open the file before emitting
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        bus.emit(SyncEvent::CycleStarted {
            list: "market-sync".into(),
            cycle: 1,
        });
        bus.emit(SyncEvent::CycleFinished {
            list: "market-sync".into(),
            cycle: 1,
            failed_steps: 0,
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        drop(bus);
        let _ = handle.await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: EventLogEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event.event_type(), "CycleStarted");
        assert!(first.ts > 0);
    }
}
