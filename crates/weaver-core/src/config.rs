use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeaverError};
use crate::security::{default_dangerous_tool_keywords, default_input_patterns, InputPattern};

/// Top-level Weaver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub event_loop: EventLoopConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Token budget for a single model call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_model_id() -> String { "claude-sonnet-4-20250514".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

/// Graph executor behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Screen node outputs for hallucinated code blocks and oversized values.
    #[serde(default = "default_check_hallucination")]
    pub check_hallucination: bool,
    /// Ask the model to repair outputs the heuristic cleaner could not fix.
    #[serde(default)]
    pub llm_output_repair: bool,
    /// Maximum characters in a single output value before it is flagged.
    #[serde(default = "default_max_output_value_chars")]
    pub max_output_value_chars: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            check_hallucination: default_check_hallucination(),
            llm_output_repair: false,
            max_output_value_chars: default_max_output_value_chars(),
        }
    }
}

fn default_check_hallucination() -> bool { true }
fn default_max_output_value_chars() -> usize { 50_000 }

/// Security guard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Upper bound for a single node execution.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_secs: u64,
    /// Ceiling on the run's shared memory footprint (serialized bytes).
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// Input string values longer than this are truncated.
    #[serde(default = "default_max_input_value_chars")]
    pub max_input_value_chars: usize,
    /// Declared tool names containing any of these keywords fail validation.
    #[serde(default = "default_dangerous_tool_keywords")]
    pub dangerous_tool_keywords: Vec<String>,
    /// Patterns screened against every input string value.
    #[serde(default = "default_input_patterns")]
    pub input_patterns: Vec<InputPattern>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_execution_time_secs: default_max_execution_time(),
            max_memory_bytes: default_max_memory_bytes(),
            max_input_value_chars: default_max_input_value_chars(),
            dangerous_tool_keywords: default_dangerous_tool_keywords(),
            input_patterns: default_input_patterns(),
        }
    }
}

fn default_max_execution_time() -> u64 { 300 }
fn default_max_memory_bytes() -> usize { 64 * 1024 * 1024 }
fn default_max_input_value_chars() -> usize { 100_000 }

/// Agentic (event-loop) node limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLoopConfig {
    /// Maximum judge iterations per node invocation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Tool calls beyond this count in one turn are rejected.
    #[serde(default = "default_max_tool_calls_per_turn")]
    pub max_tool_calls_per_turn: usize,
    /// Tool output longer than this is truncated before it re-enters the conversation.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    /// How long a sub-agent waits for an escalation response (0 = indefinitely).
    #[serde(default)]
    pub escalation_timeout_secs: u64,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tool_calls_per_turn: default_max_tool_calls_per_turn(),
            max_tool_output_chars: default_max_tool_output_chars(),
            escalation_timeout_secs: 0,
        }
    }
}

fn default_max_iterations() -> usize { 10 }
fn default_max_tool_calls_per_turn() -> usize { 16 }
fn default_max_tool_output_chars() -> usize { 16_000 }

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-node, 3 = per-step (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl LogConfig {
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(self.log_dir.as_deref().unwrap_or("logs"))
    }
}

impl EngineConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeaverError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeaverError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEAVER_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEAVER_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEAVER_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEAVER_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEAVER_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.event_loop.max_iterations, 10);
        assert_eq!(config.security.max_execution_time_secs, 300);
        assert_eq!(config.security.max_memory_bytes, 64 * 1024 * 1024);
        assert!(config.executor.check_hallucination);
        assert!(!config.executor.llm_output_repair);
        assert!(!config.security.input_patterns.is_empty());
        assert!(config.log.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[security]
max_execution_time_secs = 5

[event_loop]
max_iterations = 3
escalation_timeout_secs = 30

[log]
level = 3
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.security.max_execution_time_secs, 5);
        assert_eq!(config.event_loop.max_iterations, 3);
        assert_eq!(config.event_loop.escalation_timeout_secs, 30);
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 3);
        assert_eq!(log.log_dir(), PathBuf::from("logs"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/weaver.toml")).unwrap_err();
        assert!(matches!(err, WeaverError::ConfigNotFound(_)));
    }
}
