use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weaver_core::event::EventBus;
use weaver_core::security::Severity;
use weaver_core::types::{AgentEvent, RunId};

/// Run lifecycle collaborator. Calls are fire-and-forget: implementations
/// must not fail the run.
pub trait RunTracker: Send + Sync {
    fn start_run(&self, run_id: &RunId, goal: &str, input: &HashMap<String, Value>);
    fn end_run(&self, run_id: &RunId, success: bool, output: &HashMap<String, Value>, narrative: &str);
    fn report_problem(&self, run_id: &RunId, severity: Severity, description: &str, node_id: Option<&str>);
}

/// Tracker that only writes to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunTracker;

impl RunTracker for TracingRunTracker {
    fn start_run(&self, run_id: &RunId, goal: &str, input: &HashMap<String, Value>) {
        info!(%run_id, goal, input_keys = input.len(), "Run started");
    }

    fn end_run(&self, run_id: &RunId, success: bool, output: &HashMap<String, Value>, narrative: &str) {
        if success {
            info!(%run_id, output_keys = output.len(), "{}", narrative);
        } else {
            warn!(%run_id, output_keys = output.len(), "{}", narrative);
        }
    }

    fn report_problem(&self, run_id: &RunId, severity: Severity, description: &str, node_id: Option<&str>) {
        warn!(%run_id, %severity, node_id = node_id.unwrap_or("-"), "{}", description);
    }
}

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one JSON object per line. The file
/// is append-only, so lines written before a crash stay intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl RunLogger {
    /// Logs go to `{log_dir}/{run_id}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=per-node, 3=per-step.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write JSONL until cancellation or the run's RunComplete/RunError.
    pub async fn run(self, event_bus: Arc<EventBus>, run_id: RunId, cancel: CancellationToken) {
        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

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
        let mut rx = event_bus.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let finished = match &event {
                                AgentEvent::RunComplete { run_id: id, .. } | AgentEvent::RunError { run_id: id, .. } => *id == run_id,
                                _ => false,
                            };
                            let Some(entry) = self.event_to_entry(&run_id.0, &event) else {
                                continue;
                            };

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

                            if finished {
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

    /// None when the event is filtered out at this level.
    fn event_to_entry(&self, run_id: &str, event: &AgentEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&str>, detail: Option<Value>| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type: event_type.to_string(),
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            // L1: run summary
            AgentEvent::RunStarted { .. } => Some(entry("run_started", None, None)),
            AgentEvent::RunComplete {
                steps,
                total_tokens,
                paused_at,
                ..
            } => Some(entry(
                "run_complete",
                None,
                Some(serde_json::json!({
                    "steps": steps,
                    "total_tokens": total_tokens,
                    "paused_at": paused_at,
                })),
            )),
            AgentEvent::RunError { error, .. } => {
                Some(entry("run_error", None, Some(serde_json::json!({ "error": error }))))
            }
            AgentEvent::SecurityViolation {
                severity,
                node_id,
                detail,
            } => Some(entry(
                "security_violation",
                node_id.as_deref(),
                Some(serde_json::json!({ "severity": severity.to_string(), "detail": detail })),
            )),

            // L2: per-node
            AgentEvent::NodeStarted { node_id, attempt } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node_id),
                Some(serde_json::json!({ "attempt": attempt })),
            )),
            AgentEvent::NodeCompleted {
                node_id,
                success,
                latency_ms,
            } if self.level >= 2 => Some(entry(
                "node_completed",
                Some(node_id),
                Some(serde_json::json!({ "success": success, "latency_ms": latency_ms })),
            )),
            AgentEvent::SubagentReport {
                node_id,
                subagent_id,
                message,
                ..
            } if self.level >= 2 => Some(entry(
                "subagent_report",
                Some(node_id),
                Some(serde_json::json!({
                    "subagent_id": subagent_id,
                    "message": truncate_str(message, 200),
                })),
            )),
            AgentEvent::ClientInputRequested {
                node_id,
                escalation_id,
                ..
            } if self.level >= 2 => Some(entry(
                "client_input_requested",
                Some(node_id),
                Some(serde_json::json!({ "escalation_id": escalation_id })),
            )),

            // L3: per-step
            AgentEvent::TurnComplete { node_id, turn } if self.level >= 3 => Some(entry(
                "turn_complete",
                Some(node_id),
                Some(serde_json::json!({ "turn": turn })),
            )),
            AgentEvent::UsageUpdate {
                node_id,
                input_tokens,
                output_tokens,
            } if self.level >= 3 => Some(entry(
                "usage_update",
                Some(node_id),
                Some(serde_json::json!({
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                })),
            )),
            AgentEvent::ToolStart { node_id, name, input } if self.level >= 3 => Some(entry(
                "tool_start",
                Some(node_id),
                Some(serde_json::json!({
                    "tool": name,
                    "input": truncate_json(input, 500),
                })),
            )),
            AgentEvent::ToolEnd { node_id, name, result } if self.level >= 3 => Some(entry(
                "tool_end",
                Some(node_id),
                Some(serde_json::json!({
                    "tool": name,
                    "is_error": result.is_error,
                    "content_preview": truncate_str(&result.content, 200),
                })),
            )),

            // TextDelta, ClientOutputDelta and filtered levels
            _ => None,
        }
    }
}

fn truncate_json(value: &Value, max_len: usize) -> String {
    let s = value.to_string();
    if s.len() <= max_len {
        s
    } else {
        format!("{}...", truncate_str(&s, max_len))
    }
}

/// Truncate on a char boundary at or below `max_len` bytes.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_skips_empty_fields() {
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            run_id: "run-1".to_string(),
            event_type: "run_started".to_string(),
            node_id: None,
            detail: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run_started"));
        assert!(json.contains("run-1"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let value = serde_json::json!({"key": "a very long string that should be truncated"});
        let result = truncate_json(&value, 20);
        assert!(result.len() <= 23);
        assert!(result.ends_with("..."));
        assert_eq!(truncate_str("héllo", 2), "h");
    }

    #[test]
    fn level_filtering() {
        let node_started = AgentEvent::NodeStarted {
            node_id: "a".into(),
            attempt: 1,
        };
        let tool_start = AgentEvent::ToolStart {
            node_id: "a".into(),
            name: "echo".into(),
            input: Value::Null,
        };
        let run_started = AgentEvent::RunStarted { run_id: RunId::new() };

        let l1 = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(l1.event_to_entry("r", &run_started).is_some());
        assert!(l1.event_to_entry("r", &node_started).is_none());
        assert!(l1.event_to_entry("r", &tool_start).is_none());

        let l2 = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(l2.event_to_entry("r", &node_started).is_some());
        assert!(l2.event_to_entry("r", &tool_start).is_none());

        let l3 = RunLogger::new(PathBuf::from("/tmp"), 3);
        let entry = l3.event_to_entry("r", &tool_start).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn writes_jsonl_until_run_complete() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let run_id = RunId::from_str("run-42");
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);
        let handle = tokio::spawn(logger.run(bus.clone(), run_id.clone(), CancellationToken::new()));

        // Give the logger time to subscribe.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        bus.publish(AgentEvent::RunStarted { run_id: run_id.clone() });
        bus.publish(AgentEvent::NodeStarted {
            node_id: "a".into(),
            attempt: 1,
        });
        bus.publish(AgentEvent::RunComplete {
            run_id: run_id.clone(),
            steps: 1,
            total_tokens: 15,
            paused_at: None,
        });
        handle.await.unwrap();

        let run_dir = dir.path().join("run-42");
        let file = std::fs::read_dir(&run_dir).unwrap().next().unwrap().unwrap().path();
        let content = std::fs::read_to_string(file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("node_started"));
        assert!(lines[2].contains("\"total_tokens\":15"));
    }
}
