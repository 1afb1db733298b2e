use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use weaver_core::config::ModelConfig;
use weaver_core::traits::LlmClient;

use crate::llm_call::complete_text;

/// Decision after one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Retry { feedback: String },
}

/// A tool call made during the iteration being judged.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// What a judge sees.
#[derive(Debug, Clone)]
pub struct JudgeInput<'a> {
    /// The task the loop is working on.
    pub task: &'a str,
    pub output_keys: &'a [String],
    /// Declared output keys not yet filled via `set_output`.
    pub missing_keys: &'a [String],
    /// Values filled so far.
    pub outputs: &'a HashMap<String, Value>,
    pub tool_results: &'a [ToolOutcome],
    /// Zero-based iteration number.
    pub iteration: usize,
    pub success_criteria: Option<&'a str>,
}

/// Decides whether an agentic loop may stop.
pub trait Judge: Send + Sync {
    fn evaluate<'a>(&'a self, input: &'a JudgeInput<'a>) -> BoxFuture<'a, Verdict>;
}

/// Accepts once every declared output key is filled. A node without output
/// keys is accepted on the first iteration that makes no tool calls.
pub struct DefaultJudge;

impl Judge for DefaultJudge {
    fn evaluate<'a>(&'a self, input: &'a JudgeInput<'a>) -> BoxFuture<'a, Verdict> {
        Box::pin(async move {
            if input.output_keys.is_empty() {
                return if input.tool_results.is_empty() {
                    Verdict::Accept
                } else {
                    Verdict::Retry {
                        feedback: String::new(),
                    }
                };
            }
            if input.missing_keys.is_empty() {
                return Verdict::Accept;
            }
            Verdict::Retry {
                feedback: format!(
                    "Missing outputs: {}. Call set_output for each before finishing.",
                    input.missing_keys.join(", ")
                ),
            }
        })
    }
}

/// Judge for delegated runs. Feedback restates the delegated task so a
/// sub-agent without the parent's conversation stays on track.
pub struct SubagentJudge;

impl Judge for SubagentJudge {
    fn evaluate<'a>(&'a self, input: &'a JudgeInput<'a>) -> BoxFuture<'a, Verdict> {
        Box::pin(async move {
            if input.missing_keys.is_empty() && (!input.output_keys.is_empty() || input.tool_results.is_empty()) {
                return Verdict::Accept;
            }
            if input.missing_keys.is_empty() {
                return Verdict::Retry {
                    feedback: String::new(),
                };
            }
            Verdict::Retry {
                feedback: format!(
                    "Your task: {}\nYou have not set: {}. Use set_output for each missing key, \
                     or report_to_parent with mark_complete=true if you cannot.",
                    input.task,
                    input.missing_keys.join(", ")
                ),
            }
        })
    }
}

/// Checks `success_criteria` with the model once the default rules accept.
pub struct LlmJudge {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl LlmJudge {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self { llm, config }
    }

    async fn judge(&self, input: &JudgeInput<'_>) -> Verdict {
        let fast = DefaultJudge.evaluate(input).await;
        let criteria = match (fast, input.success_criteria) {
            (Verdict::Accept, Some(criteria)) if !criteria.trim().is_empty() => criteria,
            (verdict, _) => return verdict,
        };

        let outputs = serde_json::to_string_pretty(input.outputs).unwrap_or_default();
        let prompt = format!(
            r#"You are a judge evaluating whether an AI agent achieved its task.

Task: {}

Success criteria:
{}

Outputs:
{}

Respond with ONLY valid JSON:
{{
  "verdict": "accept" | "retry",
  "reason": "brief explanation",
  "hint": "actionable suggestion for retry (only if verdict is retry)"
}}"#,
            input.task, criteria, outputs,
        );

        match complete_text(self.llm.as_ref(), &self.config, None, prompt).await {
            Ok((text, _)) => parse_verdict(&text),
            Err(e) => {
                warn!(error = %e, "Judge LLM call failed, accepting");
                Verdict::Accept
            }
        }
    }
}

impl Judge for LlmJudge {
    fn evaluate<'a>(&'a self, input: &'a JudgeInput<'a>) -> BoxFuture<'a, Verdict> {
        Box::pin(self.judge(input))
    }
}

/// Response from the LLM judge.
#[derive(Deserialize)]
struct JudgeResponse {
    verdict: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    hint: String,
}

/// Parse a Verdict from LLM response text. Unparseable responses accept
/// rather than block the loop.
fn parse_verdict(response: &str) -> Verdict {
    match serde_json::from_str::<JudgeResponse>(extract_json(response)) {
        Ok(resp) => match resp.verdict.to_lowercase().as_str() {
            "retry" => {
                let feedback = [resp.reason, resp.hint]
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                Verdict::Retry {
                    feedback: if feedback.is_empty() {
                        "Try a different approach.".to_string()
                    } else {
                        feedback
                    },
                }
            }
            "accept" => Verdict::Accept,
            other => {
                warn!(verdict = %other, "Unknown verdict from judge, accepting");
                Verdict::Accept
            }
        },
        Err(e) => {
            warn!(error = %e, response = %response, "Failed to parse judge response");
            Verdict::Accept
        }
    }
}

/// Extract JSON from a response that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            return &trimmed[start..=end];
        }
    }
    trimmed
}
