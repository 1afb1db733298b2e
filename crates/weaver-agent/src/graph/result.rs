use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use weaver_core::error::Result;
use weaver_core::types::RunId;

use crate::guard::AuditEntry;

/// Snapshot that lets a paused run continue on a later invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub paused_at: Option<String>,
    /// Entry-point id or node id to continue from.
    pub resume_from: Option<String>,
    /// Full shared memory at the pause point.
    #[serde(default)]
    pub memory: HashMap<String, Value>,
}

impl SessionState {
    /// Write the state as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Outcome of one graph run. Failures and pauses share this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: RunId,
    pub success: bool,
    /// Memory snapshot at the end of the run.
    pub output: HashMap<String, Value>,
    pub error: Option<String>,
    /// Distinct node advances; retries are not counted.
    pub steps_executed: usize,
    pub total_tokens: u64,
    pub total_latency_ms: u64,
    /// Node ids in traversal order.
    pub path: Vec<String>,
    pub paused_at: Option<String>,
    /// Present only when the run paused.
    pub session_state: Option<SessionState>,
    /// Security events recorded during the run.
    #[serde(default)]
    pub audit_log: Vec<AuditEntry>,
}

impl ExecutionResult {
    /// A result for a run that failed before any node executed.
    pub(crate) fn rejected(run_id: RunId, error: impl Into<String>) -> Self {
        Self {
            run_id,
            success: false,
            output: HashMap::new(),
            error: Some(error.into()),
            steps_executed: 0,
            total_tokens: 0,
            total_latency_ms: 0,
            path: vec![],
            paused_at: None,
            session_state: None,
            audit_log: vec![],
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_state_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let state = SessionState {
            paused_at: Some("review".into()),
            resume_from: Some("review_resume".into()),
            memory: HashMap::from([("draft".to_string(), json!({"title": "x"}))]),
        };
        state.save(&path).unwrap();
        let loaded = SessionState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn rejected_result_shape() {
        let result = ExecutionResult::rejected(RunId::new(), "bad graph");
        assert!(!result.success);
        assert!(!result.is_paused());
        assert_eq!(result.error.as_deref(), Some("bad graph"));
        assert!(result.path.is_empty());
    }
}
