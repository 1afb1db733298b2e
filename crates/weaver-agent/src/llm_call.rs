use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use weaver_core::config::ModelConfig;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::EventBus;
use weaver_core::traits::LlmClient;
use weaver_core::types::*;

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// A tool call requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Everything one streamed model turn produced.
#[derive(Debug, Clone, Default)]
pub struct TurnOutput {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: Option<StopReason>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TurnOutput {
    pub fn tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// The assistant message to append to the conversation.
    pub fn assistant_message(&self) -> ChatMessage {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text {
                text: self.text.clone(),
            });
        }
        for call in &self.tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        ChatMessage {
            role: Role::Assistant,
            content,
            timestamp: Some(chrono::Utc::now()),
        }
    }
}

/// Stream one model turn and accumulate text, tool calls and usage.
///
/// Text deltas are forwarded to `bus` tagged with `node_id`.
pub async fn stream_turn(
    llm: &dyn LlmClient,
    model: &ModelConfig,
    messages: Vec<ChatMessage>,
    tools: &[ToolDefinition],
    bus: Option<&EventBus>,
    node_id: &str,
    cancel: &CancellationToken,
) -> Result<TurnOutput> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(WeaverError::Cancelled),
        result = llm.chat_stream(model, messages, tools) => result?,
    };

    let mut out = TurnOutput::default();
    let mut calls: Vec<ToolCallAccumulator> = Vec::new();

    while let Some(delta) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(WeaverError::Cancelled);
        }

        match delta? {
            StreamDelta::TextDelta(text) => {
                if let Some(bus) = bus {
                    bus.publish(AgentEvent::TextDelta {
                        node_id: node_id.to_string(),
                        text: text.clone(),
                    });
                }
                out.text.push_str(&text);
            }
            StreamDelta::ToolUseStart { index, id, name } => {
                while calls.len() <= index {
                    calls.push(ToolCallAccumulator::default());
                }
                calls[index].id = id;
                calls[index].name = name;
            }
            StreamDelta::ToolInputDelta { index, delta } => {
                if let Some(tc) = calls.get_mut(index) {
                    tc.input_json.push_str(&delta);
                }
            }
            StreamDelta::Stop(reason) => out.stop_reason = Some(reason),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                out.input_tokens += input_tokens;
                out.output_tokens += output_tokens;
            }
        }
    }

    out.tool_calls = calls
        .into_iter()
        .filter(|tc| !tc.name.is_empty())
        .map(|tc| ToolCall {
            input: if tc.input_json.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&tc.input_json).unwrap_or(serde_json::Value::Null)
            },
            id: tc.id,
            name: tc.name,
        })
        .collect();

    if let Some(bus) = bus {
        bus.publish(AgentEvent::UsageUpdate {
            node_id: node_id.to_string(),
            input_tokens: out.input_tokens,
            output_tokens: out.output_tokens,
        });
    }

    Ok(out)
}

/// Single tool-less request; returns the response text and tokens used.
pub async fn complete_text(
    llm: &dyn LlmClient,
    model: &ModelConfig,
    system: Option<&str>,
    prompt: impl Into<String>,
) -> Result<(String, u64)> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let turn = stream_turn(llm, model, messages, &[], None, "", &CancellationToken::new()).await?;
    let tokens = turn.tokens();
    Ok((turn.text, tokens))
}
