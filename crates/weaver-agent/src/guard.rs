use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use weaver_core::config::SecurityConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventBus;
use weaver_core::security::{dangerous_tool_keyword, InputPatternMatcher, Severity};
use weaver_core::types::AgentEvent;

use crate::memory::SharedMemory;

/// What kind of violation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    InputPattern,
    InputTruncated,
    DangerousTool,
    ExecutionTimeout,
    ResourceLimit,
}

/// One recorded security or resource event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub kind: ViolationKind,
    pub detail: String,
    pub node_id: Option<String>,
}

/// Input sanitization, execution-time and memory ceilings, and the run's audit log.
pub struct SecurityGuard {
    config: SecurityConfig,
    matcher: InputPatternMatcher,
    audit: Mutex<Vec<AuditEntry>>,
    event_bus: Option<Arc<EventBus>>,
}

impl SecurityGuard {
    pub fn new(config: SecurityConfig) -> Self {
        let matcher = InputPatternMatcher::new(&config.input_patterns);
        Self {
            config,
            matcher,
            audit: Mutex::new(Vec::new()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Screen caller input.
    ///
    /// Keys whose values match a non-critical pattern are dropped and long
    /// strings are truncated; the remainder is returned. A critical match
    /// rejects the whole input.
    pub fn sanitize_input(&self, input: &HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        let mut keys: Vec<&String> = input.keys().collect();
        keys.sort();

        let mut clean = HashMap::with_capacity(input.len());
        for key in keys {
            let value = &input[key];
            if let Some((label, severity)) = self.scan_value(value) {
                let detail = format!("input key '{}' matched {}", key, label);
                self.record(severity, ViolationKind::InputPattern, detail.clone(), None);
                if severity == Severity::Critical {
                    return Err(WeaverError::Security(detail));
                }
                continue;
            }
            clean.insert(key.clone(), self.truncate_value(key, value));
        }
        Ok(clean)
    }

    fn scan_value(&self, value: &Value) -> Option<(String, Severity)> {
        match value {
            Value::String(s) => self
                .matcher
                .check(s)
                .map(|(label, severity)| (label.to_string(), severity)),
            Value::Array(items) => items
                .iter()
                .filter_map(|v| self.scan_value(v))
                .max_by_key(|(_, severity)| *severity),
            Value::Object(map) => map
                .values()
                .filter_map(|v| self.scan_value(v))
                .max_by_key(|(_, severity)| *severity),
            _ => None,
        }
    }

    fn truncate_value(&self, key: &str, value: &Value) -> Value {
        let limit = self.config.max_input_value_chars;
        match value {
            Value::String(s) if s.chars().count() > limit => {
                self.record(
                    Severity::Low,
                    ViolationKind::InputTruncated,
                    format!("input key '{}' truncated to {} chars", key, limit),
                    None,
                );
                Value::String(s.chars().take(limit).collect())
            }
            other => other.clone(),
        }
    }

    /// Errors for declared tool names containing a dangerous keyword.
    pub fn validate_tool_names<'a>(&self, tools: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<String> {
        let mut errors = Vec::new();
        for (node_id, tool) in tools {
            if let Some(keyword) = dangerous_tool_keyword(tool, &self.config.dangerous_tool_keywords) {
                let detail = format!(
                    "Node '{}' declares tool '{}' matching dangerous keyword '{}'",
                    node_id, tool, keyword
                );
                self.record(
                    Severity::High,
                    ViolationKind::DangerousTool,
                    detail.clone(),
                    Some(node_id),
                );
                errors.push(detail);
            }
        }
        errors
    }

    /// Run `fut` under the configured execution-time ceiling.
    pub async fn run_with_timeout<F, T>(&self, node_id: &str, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let secs = self.config.max_execution_time_secs;
        match tokio::time::timeout(Duration::from_secs(secs), fut).await {
            Ok(value) => Ok(value),
            Err(_) => {
                self.record(
                    Severity::High,
                    ViolationKind::ExecutionTimeout,
                    format!("node exceeded {}s", secs),
                    Some(node_id),
                );
                Err(WeaverError::ExecutionTimeout {
                    node: node_id.to_string(),
                    timeout_secs: secs,
                })
            }
        }
    }

    /// Fail when the run's shared memory has outgrown its ceiling.
    pub fn check_resources(&self, memory: &SharedMemory) -> Result<()> {
        let used = memory.footprint_bytes();
        if used > self.config.max_memory_bytes {
            let detail = format!(
                "shared memory uses {} bytes, limit is {}",
                used, self.config.max_memory_bytes
            );
            self.record(Severity::Critical, ViolationKind::ResourceLimit, detail.clone(), None);
            return Err(WeaverError::ResourceLimit(detail));
        }
        Ok(())
    }

    /// Everything recorded so far, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, severity: Severity, kind: ViolationKind, detail: String, node_id: Option<&str>) {
        if severity >= Severity::High {
            error!(%severity, ?kind, node_id = node_id.unwrap_or("-"), "{}", detail);
        } else {
            warn!(%severity, ?kind, node_id = node_id.unwrap_or("-"), "{}", detail);
        }

        if let Some(bus) = &self.event_bus {
            bus.publish(AgentEvent::SecurityViolation {
                severity,
                node_id: node_id.map(str::to_string),
                detail: detail.clone(),
            });
        }

        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AuditEntry {
                timestamp: Utc::now(),
                severity,
                kind,
                detail,
                node_id: node_id.map(str::to_string),
            });
    }
}
