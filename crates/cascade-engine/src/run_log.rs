use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cascade_core::event::EventBus;
use cascade_core::types::{WorkflowEvent, WorkflowId};

/// JSONL workflow logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for a
/// single workflow to `{log_dir}/{workflow_id}/{timestamp}.jsonl`.
/// Lines already written survive a crash.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    workflow_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = lifecycle, 2 = per-role, 3 = handoffs and recovery.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Run until cancelled or the workflow reaches a terminal state.
    pub async fn run(self, event_bus: Arc<EventBus>, workflow_id: WorkflowId, cancel: CancellationToken) {
        // Subscribe before any await so no early event is missed
        let mut rx = event_bus.subscribe();

        let workflow_dir = self.log_dir.join(&workflow_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&workflow_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = workflow_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.workflow_id() != &workflow_id {
                                continue;
                            }
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if event.is_terminal() {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// None when the event is filtered out by level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let (level, event_type, role, detail) = match event {
            // L1: lifecycle
            WorkflowEvent::Created { roles, .. } => {
                (1, "created", None, Some(serde_json::json!({ "roles": roles })))
            }
            WorkflowEvent::Queued { priority, .. } => {
                (1, "queued", None, Some(serde_json::json!({ "priority": priority })))
            }
            WorkflowEvent::Started { .. } => (1, "started", None, None),
            WorkflowEvent::Paused { reason, .. } => {
                (1, "paused", None, Some(serde_json::json!({ "reason": reason })))
            }
            WorkflowEvent::Resumed { .. } => (1, "resumed", None, None),
            WorkflowEvent::Cancelled { .. } => (1, "cancelled", None, None),
            WorkflowEvent::Completed { total_ms, .. } => {
                (1, "completed", None, Some(serde_json::json!({ "total_ms": total_ms })))
            }
            WorkflowEvent::Failed { error, .. } => {
                (1, "failed", None, Some(serde_json::json!({ "error": error })))
            }

            // L2: per role
            WorkflowEvent::RoleStarted { role, index, .. } => (
                2,
                "role_started",
                Some(role),
                Some(serde_json::json!({ "index": index })),
            ),
            WorkflowEvent::RoleCompleted { role, elapsed_ms, .. } => (
                2,
                "role_completed",
                Some(role),
                Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            ),
            WorkflowEvent::RoleFailed { role, error, .. } => (
                2,
                "role_failed",
                Some(role),
                Some(serde_json::json!({ "error": truncate_str(error, 500) })),
            ),

            // L3: handoffs and recovery detail
            WorkflowEvent::HandoffCreated { from, to, score, .. } => (
                3,
                "handoff_created",
                Some(from),
                Some(serde_json::json!({ "to": to, "score": score })),
            ),
            WorkflowEvent::RecoveryDecided {
                role,
                action,
                automatic,
                ..
            } => (
                3,
                "recovery_decided",
                Some(role),
                Some(serde_json::json!({ "action": action, "automatic": automatic })),
            ),
        };

        if level > self.level {
            return None;
        }
        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            workflow_id: event.workflow_id().0.clone(),
            event_type: event_type.to_string(),
            role: role.cloned(),
            detail,
        })
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> WorkflowId {
        WorkflowId::from_str("wf-log")
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&WorkflowEvent::Started { workflow_id: wf() })
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_type\":\"started\""));
        assert!(!json.contains("role"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let role_started = WorkflowEvent::RoleStarted {
            workflow_id: wf(),
            role: "coder".into(),
            index: 1,
        };
        let recovery = WorkflowEvent::RecoveryDecided {
            workflow_id: wf(),
            role: "coder".into(),
            action: "retry".into(),
            automatic: true,
        };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry(&role_started).is_none());
        assert!(l1.event_to_entry(&recovery).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry(&role_started).is_some());
        assert!(l2.event_to_entry(&recovery).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry(&recovery).unwrap();
        assert_eq!(entry.role.as_deref(), Some("coder"));
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("abcdef", 3), "abc...");
        assert_eq!(truncate_str("héllo", 10), "héllo");
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);

        let handle = tokio::spawn(logger.run(bus.clone(), wf(), CancellationToken::new()));
        // Let the logger subscribe
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        bus.publish(WorkflowEvent::Started { workflow_id: wf() });
        bus.publish(WorkflowEvent::Started {
            workflow_id: WorkflowId::from_str("other"),
        });
        bus.publish(WorkflowEvent::RoleStarted {
            workflow_id: wf(),
            role: "planner".into(),
            index: 0,
        });
        bus.publish(WorkflowEvent::Completed {
            workflow_id: wf(),
            total_ms: 12,
        });
        handle.await.unwrap();

        let mut files = std::fs::read_dir(dir.path().join("wf-log")).unwrap();
        let path = files.next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("started"));
        assert!(lines[2].contains("completed"));
    }
}
