use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use weaver_core::config::{ExecutorConfig, ModelConfig};
use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::LlmClient;

use crate::graph::NodeSpec;
use crate::llm_call::complete_text;

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    /// All errors joined into one message.
    pub fn error(&self) -> String {
        self.errors.join("; ")
    }
}

/// Checks node output against declared keys.
pub struct OutputValidator {
    /// Flag values that look like an unparsed model response or are oversized.
    pub check_hallucination: bool,
    /// Maximum characters in a single string value.
    pub max_value_chars: usize,
}

impl OutputValidator {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            check_hallucination: config.check_hallucination,
            max_value_chars: config.max_output_value_chars,
        }
    }

    /// Every expected key must be present and non-null.
    pub fn validate_all(&self, output: &HashMap<String, Value>, expected_keys: &[String]) -> ValidationResult {
        let mut errors = Vec::new();

        for key in expected_keys {
            match output.get(key) {
                None | Some(Value::Null) => errors.push(format!("Missing required output key: '{}'", key)),
                Some(value) if self.check_hallucination => {
                    if let Value::String(s) = value {
                        if s.chars().count() > self.max_value_chars {
                            errors.push(format!(
                                "Output key '{}' exceeds max length: {} > {}",
                                key,
                                s.chars().count(),
                                self.max_value_chars
                            ));
                        } else if looks_unparsed(key, s) {
                            errors.push(format!("Output key '{}' holds an unparsed model response", key));
                        }
                    }
                }
                Some(_) => {}
            }
        }

        ValidationResult { errors }
    }

    /// Check the parts of `output` the target node will consume.
    ///
    /// Keys the output does not carry are not errors; the target may find them
    /// in memory.
    pub fn validate_output(
        &self,
        output: &HashMap<String, Value>,
        source_node: &str,
        target: &NodeSpec,
    ) -> ValidationResult {
        let mut errors = Vec::new();
        for key in &target.input_keys {
            match output.get(key) {
                Some(Value::Null) => errors.push(format!(
                    "'{}' from '{}' is null but '{}' expects it",
                    key, source_node, target.id
                )),
                Some(Value::String(s)) if looks_unparsed(key, s) => errors.push(format!(
                    "'{}' from '{}' holds an unparsed model response",
                    key, source_node
                )),
                _ => {}
            }
        }
        ValidationResult { errors }
    }
}

/// A string that is a fenced block, or a JSON object carrying `key` itself.
fn looks_unparsed(key: &str, s: &str) -> bool {
    let trimmed = s.trim();
    if trimmed.starts_with("```") {
        return true;
    }
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            return map.contains_key(key);
        }
    }
    false
}

/// Cleans and repairs malformed output.
pub struct OutputCleaner {
    llm: Option<Arc<dyn LlmClient>>,
    config: Option<ModelConfig>,
}

impl OutputCleaner {
    /// Create a cleaner with LLM repair capability.
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            llm: Some(llm),
            config: Some(config),
        }
    }

    /// Create a cleaner with heuristic repair only (no LLM calls).
    pub fn heuristic_only() -> Self {
        Self {
            llm: None,
            config: None,
        }
    }

    /// Repair `output` towards `expected_keys`: heuristics first, then the
    /// model when one is configured and keys are still missing.
    pub async fn clean(&self, output: &HashMap<String, Value>, expected_keys: &[String], issues: &[String]) -> HashMap<String, Value> {
        let cleaned = Self::extract_keys(output, expected_keys);
        let still_missing = expected_keys
            .iter()
            .any(|k| matches!(cleaned.get(k), None | Some(Value::Null)));

        if !still_missing || self.llm.is_none() {
            return cleaned;
        }

        match self.llm_repair(&cleaned, expected_keys, issues).await {
            Ok(repaired) => repaired,
            Err(e) => {
                warn!(error = %e, "LLM output repair failed, keeping heuristic result");
                cleaned
            }
        }
    }

    /// Edge-time cleaning of a source node's output for `target`.
    pub async fn clean_output(
        &self,
        output: &HashMap<String, Value>,
        source_node: &str,
        target: &NodeSpec,
        validation_errors: &[String],
    ) -> HashMap<String, Value> {
        debug!(
            source = %source_node,
            target = %target.id,
            issues = validation_errors.len(),
            "Cleaning output for edge"
        );
        let present: Vec<String> = target
            .input_keys
            .iter()
            .filter(|k| output.contains_key(*k))
            .cloned()
            .collect();
        self.clean(output, &present, validation_errors).await
    }

    /// Parse fenced or JSON-wrapped string values, and lift `expected_keys`
    /// out of any object value that carries them.
    pub fn extract_keys(output: &HashMap<String, Value>, expected_keys: &[String]) -> HashMap<String, Value> {
        let mut result = HashMap::with_capacity(output.len());

        for (key, value) in output {
            let parsed = match value {
                Value::String(s) => parse_embedded_json(s).unwrap_or_else(|| value.clone()),
                other => other.clone(),
            };
            // {"summary": {"summary": "..."}} -> {"summary": "..."}
            let unwrapped = match &parsed {
                Value::Object(map) if map.contains_key(key) => map[key].clone(),
                _ => parsed,
            };
            result.insert(key.clone(), unwrapped);
        }

        for key in expected_keys {
            if !matches!(result.get(key), None | Some(Value::Null)) {
                continue;
            }
            let lifted = output.values().find_map(|v| {
                let obj = match v {
                    Value::Object(map) => Some(map.clone()),
                    Value::String(s) => match parse_embedded_json(s) {
                        Some(Value::Object(map)) => Some(map),
                        _ => None,
                    },
                    _ => None,
                }?;
                obj.get(key).filter(|v| !v.is_null()).cloned()
            });
            if let Some(value) = lifted {
                result.insert(key.clone(), value);
            }
        }

        result
    }

    /// Apply heuristic repairs to output.
    /// - Strips markdown code fences
    /// - Balances JSON braces
    /// - Trims whitespace
    pub fn heuristic_repair(output: &str) -> String {
        let mut result = output.to_string();

        // Strip markdown code fences
        result = strip_code_fences(&result);

        // Trim whitespace
        result = result.trim().to_string();

        // Balance JSON braces if output looks like JSON
        if result.starts_with('{') || result.starts_with('[') {
            result = balance_braces(&result);
        }

        result
    }

    /// Ask the LLM to produce a JSON object with `expected_keys`.
    pub async fn llm_repair(
        &self,
        output: &HashMap<String, Value>,
        expected_keys: &[String],
        issues: &[String],
    ) -> Result<HashMap<String, Value>> {
        let (Some(llm), Some(config)) = (self.llm.as_ref(), self.config.as_ref()) else {
            return Err(WeaverError::LlmUnavailable("output repair".into()));
        };

        let current = serde_json::to_string_pretty(output)?;
        let prompt = format!(
            r#"The following output has issues that need to be fixed:

Issues:
- {}

Required keys: {}

Original output:
{}

Fix the output to resolve these issues. Return ONLY a JSON object with the required keys, nothing else."#,
            issues.join("\n- "),
            expected_keys.join(", "),
            current
        );

        debug!("Running LLM output repair");
        let (text, _tokens) = complete_text(llm.as_ref(), config, None, prompt).await?;
        if text.trim().is_empty() {
            warn!("LLM repair returned empty response");
            return Ok(output.clone());
        }

        let repaired = Self::heuristic_repair(&text);
        match serde_json::from_str::<Value>(&repaired) {
            Ok(Value::Object(map)) => {
                let mut merged = output.clone();
                merged.extend(map);
                Ok(merged)
            }
            _ => Err(WeaverError::LlmParse(format!(
                "repair response is not a JSON object: {}",
                repaired.chars().take(200).collect::<String>()
            ))),
        }
    }
}

fn parse_embedded_json(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if !(trimmed.starts_with("```") || trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(&OutputCleaner::heuristic_repair(trimmed)).ok()
}

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[\w-]*[ \t]*\n?(.*?)```").ok())
        .as_ref()
}

/// Strip markdown code fences from text, keeping the first fenced block.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    fence_pattern()
        .and_then(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map_or_else(|| trimmed.to_string(), |body| body.as_str().trim().to_string())
}

/// Balance JSON braces/brackets by appending missing closers.
fn balance_braces(text: &str) -> String {
    let mut brace_depth: i32 = 0;
    let mut bracket_depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for ch in text.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => brace_depth += 1,
            '}' => brace_depth -= 1,
            '[' => bracket_depth += 1,
            ']' => bracket_depth -= 1,
            _ => {}
        }
    }

    let mut result = text.to_string();
    for _ in 0..bracket_depth {
        result.push(']');
    }
    for _ in 0..brace_depth {
        result.push('}');
    }
    result
}
