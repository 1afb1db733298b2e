//! Shared mocks for Weaver tests: a scripted LLM client and a few tools.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use weaver_core::config::ModelConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::traits::{LlmClient, Tool};
use weaver_core::types::{ChatMessage, StopReason, StreamDelta, ToolContext, ToolDefinition, ToolResult};

/// One recorded `chat_stream` call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

/// LLM client that replays scripted responses, one per call.
///
/// Once the script is exhausted every further call answers with plain text
/// "done" and no tool calls.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Vec<StreamDelta>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Vec<StreamDelta>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
        tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.requests.lock().unwrap().push(RecordedRequest {
            messages,
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_response("done"));
        Box::pin(async move { Ok(stream::iter(next.into_iter().map(Ok)).boxed()) })
    }
}

/// LLM client whose every call fails.
pub struct FailingLlm;

impl LlmClient for FailingLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        _messages: Vec<ChatMessage>,
        _tools: &[ToolDefinition],
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        Box::pin(async { Err(WeaverError::LlmRequest("connection refused".into())) })
    }
}

/// A plain text answer that ends the turn.
pub fn text_response(text: &str) -> Vec<StreamDelta> {
    vec![
        StreamDelta::TextDelta(text.to_string()),
        StreamDelta::Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
        StreamDelta::Stop(StopReason::EndTurn),
    ]
}

/// A turn that requests the given tool calls.
pub fn tool_call_response(calls: &[(&str, serde_json::Value)]) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    for (index, (name, input)) in calls.iter().enumerate() {
        deltas.push(StreamDelta::ToolUseStart {
            index,
            id: format!("call_{}", index),
            name: name.to_string(),
        });
        deltas.push(StreamDelta::ToolInputDelta {
            index,
            delta: input.to_string(),
        });
    }
    deltas.push(StreamDelta::Usage {
        input_tokens: 10,
        output_tokens: 5,
    });
    deltas.push(StreamDelta::Stop(StopReason::ToolUse));
    deltas
}

/// Echoes its `text` input.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given text"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn execute(&self, input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let text = input["text"]
                .as_str()
                .ok_or_else(|| WeaverError::ToolValidation("'text' must be a string".into()))?;
            Ok(ToolResult::success(text))
        })
    }
}

/// Always reports a tool-level error.
pub struct FailingTool;

impl Tool for FailingTool {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn description(&self) -> &str {
        "A tool that always fails"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async { Ok(ToolResult::error("boom")) })
    }
}

/// Sleeps for `delay_secs` before answering; its own timeout is one second.
pub struct SlowTool {
    pub delay_secs: u64,
}

impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "A tool that takes its time"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({ "type": "object" })
    }

    fn timeout_secs(&self) -> u64 {
        1
    }

    fn execute(&self, _input: serde_json::Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        let delay = Duration::from_secs(self.delay_secs);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(ToolResult::success("finally"))
        })
    }
}
