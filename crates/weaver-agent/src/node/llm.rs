use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info};

use weaver_core::error::{Result, WeaverError};
use weaver_core::types::{ChatMessage, ContentBlock, Role};

use super::{ingest_output, NodeContext, NodeProtocol, NodeResult};
use crate::graph::NodeKind;
use crate::llm_call::stream_turn;

const DEFAULT_PROMPT: &str = "Complete the task.";

/// Model-backed node: plain generation, or a bounded tool-use loop.
pub struct LlmNode {
    kind: NodeKind,
}

impl LlmNode {
    pub fn generate() -> Self {
        Self {
            kind: NodeKind::LlmGenerate,
        }
    }

    pub fn tool_use() -> Self {
        Self {
            kind: NodeKind::LlmToolUse,
        }
    }

    fn system_prompt(&self, ctx: &NodeContext) -> String {
        let mut prompt = ctx.goal.to_prompt_context();
        if !ctx.spec.output_keys.is_empty() {
            prompt.push_str(&format!(
                "\nRespond with ONLY a JSON object containing these keys: {}\n",
                ctx.spec.output_keys.join(", ")
            ));
        }
        prompt
    }

    async fn run(&self, ctx: &NodeContext) -> Result<NodeResult> {
        let start = Instant::now();
        let llm = ctx.llm()?;
        let tools = match self.kind {
            NodeKind::LlmToolUse => ctx.available_tools.clone(),
            _ => vec![],
        };

        let base_prompt = ctx.spec.system_prompt.as_deref().unwrap_or(DEFAULT_PROMPT);
        let mut messages = vec![
            ChatMessage::system(self.system_prompt(ctx)),
            ChatMessage::user(ctx.spec.build_prompt(base_prompt, &ctx.context_data())),
        ];

        let mut tokens = 0u64;
        for turn in 0..ctx.spec.max_turns {
            debug!(node_id = %ctx.node_id, turn, "LLM node turn");
            let out = stream_turn(
                llm.as_ref(),
                &ctx.model,
                messages.clone(),
                &tools,
                ctx.event_bus.as_deref(),
                &ctx.node_id,
                &ctx.cancel,
            )
            .await?;
            tokens += out.tokens();
            messages.push(out.assistant_message());

            if out.tool_calls.is_empty() {
                info!(node_id = %ctx.node_id, turns = turn + 1, tokens, "LLM node complete");
                let output = ingest_output(&ctx.spec.output_keys, &out.text);
                let mut result = NodeResult::ok(output).with_tokens(tokens);
                result.latency_ms = start.elapsed().as_millis() as u64;
                return Ok(result);
            }

            let mut blocks = Vec::with_capacity(out.tool_calls.len());
            for call in out.tool_calls {
                let result = ctx.call_tool(&call.name, call.input).await;
                blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call.id,
                    content: result.content,
                    is_error: result.is_error,
                });
            }
            messages.push(ChatMessage {
                role: Role::User,
                content: blocks,
                timestamp: Some(chrono::Utc::now()),
            });
        }

        Err(WeaverError::MaxIterationsExceeded(ctx.spec.max_turns))
    }
}

impl NodeProtocol for LlmNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn execute<'a>(&'a self, ctx: &'a NodeContext) -> BoxFuture<'a, Result<NodeResult>> {
        Box::pin(self.run(ctx))
    }
}
